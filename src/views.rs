use crate::{model_service::Prediction, state::ClassInfo};

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Lymphoma Detector</title>
    <style>
        body { font-family: sans-serif; max-width: 720px; margin: 2rem auto; color: #222; }
        .card { border: 1px solid #ddd; border-radius: 8px; padding: 1.5rem; margin-top: 1rem; }
        .error { background: #f8d7da; color: #721c24; padding: 0.75rem; border-radius: 6px; }
        .confidence { font-size: 1.5rem; font-weight: bold; }
        img { max-width: 320px; border-radius: 8px; box-shadow: 0 4px 8px rgba(0,0,0,0.1); }
    </style>
</head>
<body>
    <h1>Lymphoma Detector</h1>
"#;

const PAGE_FOOT: &str = "</body>\n</html>\n";

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Upload form, with an optional flashed error message above it.
pub fn index_page(error: Option<&str>) -> String {
    let flash = error
        .map(|message| format!("    <p class=\"error\">{}</p>\n", escape_html(message)))
        .unwrap_or_default();

    format!(
        r#"{head}{flash}    <div class="card">
        <p>Upload a microscopy image (JPG, JPEG, PNG, TIF) to classify it as CLL, FL or MCL.</p>
        <form id="upload-form" action="/predict" method="post" enctype="multipart/form-data">
            <input id="file-input" type="file" name="file" accept=".png,.jpg,.jpeg,.tif,.tiff" required>
            <button id="analyze-btn" type="submit">Analyze</button>
        </form>
    </div>
{foot}"#,
        head = PAGE_HEAD,
        flash = flash,
        foot = PAGE_FOOT,
    )
}

pub fn result_page(prediction: &Prediction, info: &ClassInfo, image_url: &str) -> String {
    format!(
        r#"{head}    <div class="card">
        <img src="{image_url}" alt="Uploaded image">
        <h2>{label} &ndash; {full_name}</h2>
        <p class="confidence">Confidence: {confidence:.2}%</p>
        <h3>Description</h3>
        <p>{description}</p>
        <h3>Characteristics</h3>
        <p>{characteristics}</p>
        <p><a href="/">Analyze another image</a></p>
    </div>
{foot}"#,
        head = PAGE_HEAD,
        image_url = escape_html(image_url),
        label = escape_html(&prediction.label),
        full_name = escape_html(info.full_name),
        confidence = prediction.confidence,
        description = escape_html(info.description),
        characteristics = escape_html(info.characteristics),
        foot = PAGE_FOOT,
    )
}
