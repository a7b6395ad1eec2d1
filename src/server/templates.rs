//! HTML pages served by the web form. Text that may come from outside the
//! binary is escaped; numbers and base64 are written as-is

use crate::model::Prediction;

const UPLOAD_FORM: &str = r#"<form action="/predict" method="post" enctype="multipart/form-data">
    <label>Select image to upload:</label>
    <input type="file" name="image">
    <input type="submit" value="Upload Image">
</form>"#;

/// The landing page
pub fn index() -> String {
    format!("<!DOCTYPE html>\n<html>\n<body>\n{UPLOAD_FORM}\n</body>\n</html>\n")
}

/// Everything shown after a successful prediction
#[derive(Debug)]
pub struct ResultPage<'a> {
    /// The uploaded image, PNG encoded, as base64
    pub png_base64: &'a str,
    pub prediction: &'a Prediction,
    pub elapsed_secs: f64,
}

impl ResultPage<'_> {
    pub fn render(&self) -> String {
        let label = match &self.prediction.label {
            Some(label) => format!(
                "<p>Label: {}</p>\n",
                html_escape::encode_text(label)
            ),
            None => String::new(),
        };

        format!(
            "<!DOCTYPE html>\n<html>\n<body>\n\
             <img src=\"data:image/png;base64,{img}\" alt=\"image\" width=\"500\" height=\"600\">\n\
             {UPLOAD_FORM}\n\
             <p>Prediction: {index}</p>\n\
             {label}\
             <p>Score: {score:.2}</p>\n\
             <p>Time taken: {elapsed:.2} seconds</p>\n\
             </body>\n</html>\n",
            img = self.png_base64,
            index = self.prediction.index,
            score = self.prediction.score,
            elapsed = self.elapsed_secs,
        )
    }
}
