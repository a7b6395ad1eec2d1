use actix_web::{middleware, web, App, HttpServer};
use imgserve::config::Settings;
use imgserve::model::Predictor;
use imgserve::server::{self, UploadLimit};
use imgserve::util::init_tracing;
use std::process;
use tch::Device;
use tracing::{error, info};

fn load() -> anyhow::Result<(Settings, Predictor)> {
    let settings = Settings::load()?;

    let device = if settings.use_cuda {
        Device::cuda_if_available()
    } else {
        Device::Cpu
    };
    let predictor = Predictor::load(&settings.model_dir, device)?;

    Ok((settings, predictor))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_tracing();

    // The model must be in memory before any request is accepted
    let (settings, predictor) = match load() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("failed to start: {e:#}");
            process::exit(1);
        }
    };
    let predictor = web::Data::new(predictor);
    let upload_limit = web::Data::new(UploadLimit(settings.max_upload_bytes));

    let addr = settings.bind_addr();
    info!("listening on http://{addr}");

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(predictor.clone())
            .app_data(upload_limit.clone())
            .wrap(middleware::Logger::default())
            .configure(server::configure)
    });
    if let Some(workers) = settings.workers {
        server = server.workers(workers);
    }

    server.bind(addr)?.run().await
}
