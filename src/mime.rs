use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufRead;

use once_cell::sync::Lazy;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// TODO: Include this as a file.
const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

static DEFAULT_MIME_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    let mut mimetypes = HashMap::new();
    for line in DEFAULT_EXTENSIONS_MAP {
        add_mimetype_line(&mut mimetypes, line);
    }
    mimetypes
});

/// Extension to MIME type lookup table.
#[derive(Debug, Clone)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: String,
}

impl MimeMap {
    /// Create MimeMap using the default extension map.
    pub fn parse_default_extension_map() -> MimeMap {
        MimeMap {
            mimetypes: DEFAULT_MIME_MAP.clone(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        }
    }

    /// Add extension map from a file. Parse failures abort in the caller.
    pub fn parse_extension_map_file(&mut self, filename: &OsStr) -> std::io::Result<()> {
        let file = File::open(filename)?;
        for line in std::io::BufReader::new(file).lines() {
            add_mimetype_line(&mut self.mimetypes, &line?);
        }
        Ok(())
    }

    /// Get content type for a URL.
    pub fn url_content_type(&self, url: &str) -> &str {
        url.rsplit('.')
            .next()
            .and_then(|extension| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

/// Add line from an extension map.
fn add_mimetype_line(mimetypes: &mut HashMap<String, String>, line: &str) {
    let mut fields = line
        .split(|c| matches!(c, ' ' | '\t'))
        .filter(|field| !field.is_empty());
    let mimetype = match fields.next() {
        Some(mimetype) => mimetype,
        None => return, // empty line
    };
    if mimetype.starts_with('#') {
        return; // comment
    }
    for extension in fields {
        mimetypes.insert(extension.to_string(), mimetype.to_string());
    }
}
