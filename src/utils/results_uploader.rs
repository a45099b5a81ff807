use std::path::Path;

use anyhow::bail;

/// What happens with a report file once a run is over.
pub trait ResultHandler {
    fn handle_result(&self, path: &Path) -> anyhow::Result<()>;
}

/// Leaves the report where it was written.
pub struct KeepLocal {}

impl ResultHandler for KeepLocal {
    fn handle_result(&self, path: &Path) -> anyhow::Result<()> {
        info!("report written to '{}'", path.display());
        Ok(())
    }
}

/// Uploads the report with `curl -T`.
pub struct ResultsUploader {
    push_url: String,
    curl: String,
}

impl ResultsUploader {
    pub fn new(url: String) -> Self {
        Self::with_curl(url, "curl")
    }

    pub fn with_curl(url: String, curl: &str) -> Self {
        ResultsUploader {
            push_url: url,
            curl: curl.to_string(),
        }
    }
}

impl ResultHandler for ResultsUploader {
    fn handle_result(&self, file: &Path) -> anyhow::Result<()> {
        if !file.exists() {
            bail!("report file '{}' does not exist", file.display());
        }

        let exit = subprocess::Exec::cmd(&self.curl)
            .arg("--silent")
            .arg("--fail")
            .arg(&self.push_url)
            .arg("-T")
            .arg(file.as_os_str())
            .join()?;

        if !exit.success() {
            bail!(
                "failed to upload report '{}' to {}, curl exit code {:?}",
                file.display(),
                self.push_url,
                exit
            );
        }
        info!("report '{}' uploaded to {}", file.display(), self.push_url);
        Ok(())
    }
}

pub fn handler_for(push_url: Option<String>) -> Box<dyn ResultHandler> {
    match push_url {
        Some(url) => Box::new(ResultsUploader::new(url)),
        None => Box::new(KeepLocal {}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_rejected() {
        let up = ResultsUploader::with_curl("http://localhost/".to_string(), "true");
        assert!(up.handle_result(Path::new("/nonexistent/report.csv")).is_err());
    }

    #[test]
    fn uploader_reports_curl_failures() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ok = ResultsUploader::with_curl("http://localhost/".to_string(), "true");
        let failing = ResultsUploader::with_curl("http://localhost/".to_string(), "false");
        assert!(ok.handle_result(file.path()).is_ok());
        assert!(failing.handle_result(file.path()).is_err());
    }
}
