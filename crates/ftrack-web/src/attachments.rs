//! Downloads a faculty event's attachment files and packs them into one zip archive.

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Folder every archive entry is written under.
pub const ZIP_FOLDER: &str = "event_attachments";

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AttachmentFetcher {
    client: reqwest::Client,
}

impl AttachmentFetcher {
    pub fn new(timeout: Duration) -> Result<Self, AttachmentError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .map_err(AttachmentError::Client)?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AttachmentError> {
        let failed = |source| AttachmentError::Fetch {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(failed)?;
        let body = response.bytes().await.map_err(failed)?;
        Ok(body.to_vec())
    }

    /// Download every url in order; any failed download fails the whole archive.
    pub async fn bundle(&self, urls: &[String]) -> Result<Vec<u8>, AttachmentError> {
        let span = info_span!("bundle_attachments", count = urls.len());
        async {
            let mut files = Vec::with_capacity(urls.len());
            for url in urls {
                files.push((url.as_str(), self.fetch(url).await?));
            }
            write_zip(&files)
        }
        .instrument(span)
        .await
    }
}

/// Pack `(url, bytes)` pairs under [`ZIP_FOLDER`], naming each entry after its url.
pub fn write_zip(files: &[(&str, Vec<u8>)]) -> Result<Vec<u8>, AttachmentError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut used = HashSet::new();
    for (index, (url, bytes)) in files.iter().enumerate() {
        let base = entry_name(url, index);
        let mut name = base.clone();
        let mut copy = 1;
        while !used.insert(name.clone()) {
            copy += 1;
            name = format!("{copy}-{base}");
        }
        zip.start_file(format!("{ZIP_FOLDER}/{name}"), options)?;
        zip.write_all(bytes)?;
        debug!(entry = %name, bytes = bytes.len(), "attachment added");
    }
    Ok(zip.finish()?.into_inner())
}

/// Last path segment of `url` without query or fragment, or `attachment-<n>`.
pub fn entry_name(url: &str, index: usize) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let segment = rest
        .split_once('/')
        .and_then(|(_, path)| path.rsplit('/').next())
        .map(str::trim)
        .unwrap_or_default();
    match segment {
        "" | "." | ".." => format!("attachment-{}", index + 1),
        name => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;

    #[test]
    fn entries_are_named_after_the_url_path() {
        assert_eq!(
            entry_name("https://files.example/faculty-events/7/poster.png?token=abc", 0),
            "poster.png"
        );
        assert_eq!(entry_name("https://files.example/", 2), "attachment-3");
        assert_eq!(entry_name("https://files.example", 0), "attachment-1");
        assert_eq!(entry_name("https://files.example/a/..", 1), "attachment-2");
    }

    #[test]
    fn repeated_names_get_a_numeric_prefix() {
        let bytes = write_zip(&[
            ("https://a.example/x/photo.jpg", b"one".to_vec()),
            ("https://b.example/y/photo.jpg", b"two".to_vec()),
        ])
        .unwrap();

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["event_attachments/2-photo.jpg", "event_attachments/photo.jpg"]
        );

        let mut second = String::new();
        archive
            .by_name("event_attachments/2-photo.jpg")
            .unwrap()
            .read_to_string(&mut second)
            .unwrap();
        assert_eq!(second, "two");
    }
}
