use reproxy_core::config::ErrorConfig;

/// Renders user-facing error bodies, either a plain one-line message or, when `error.nice` is
/// set, from a template substituting `{ErrMessage}`/`{ErrCode}`. A missing or unreadable
/// template file falls back to plain for every subsequent call — it is read once, at startup.
pub struct ErrorReporter {
    template: Option<String>,
}

impl ErrorReporter {
    pub fn new(cfg: &ErrorConfig) -> Self {
        let template = if cfg.nice {
            match &cfg.template {
                Some(path) => match std::fs::read_to_string(path) {
                    Ok(contents) => Some(contents),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "error template unreadable, falling back to plain error bodies");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };
        Self { template }
    }

    /// Body bytes and any extra headers (content-type) for a `status` error response. Plain
    /// mode always writes the literal `Server error\n` regardless of status; the HTTP status
    /// phrase (`ErrMessage`) is only ever substituted into the templated body.
    pub fn render(&self, status: u16) -> (Vec<u8>, Vec<(String, String)>) {
        match &self.template {
            Some(tpl) => {
                let message = crate::proxy::status_text(status);
                let body = tpl.replace("{ErrMessage}", message).replace("{ErrCode}", &status.to_string());
                (
                    body.into_bytes(),
                    vec![
                        ("content-type".to_string(), "text/html; charset=utf-8".to_string()),
                        ("x-content-type-options".to_string(), "nosniff".to_string()),
                    ],
                )
            }
            None => (b"Server error\n".to_vec(), vec![("content-type".to_string(), "text/plain".to_string())]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mode_always_renders_the_literal_server_error_body() {
        let reporter = ErrorReporter::new(&ErrorConfig { nice: false, template: None });
        let (body, _) = reporter.render(502);
        assert_eq!(body, b"Server error\n");
        let (body, _) = reporter.render(404);
        assert_eq!(body, b"Server error\n");
    }

    #[test]
    fn nice_mode_without_a_readable_template_falls_back_to_plain() {
        let reporter =
            ErrorReporter::new(&ErrorConfig { nice: true, template: Some("/nonexistent/template.html".into()) });
        let (body, _) = reporter.render(404);
        assert_eq!(body, b"Server error\n");
    }

    #[test]
    fn templated_mode_substitutes_vars_and_sets_nosniff() {
        let dir = std::env::temp_dir().join(format!("reproxy-error-tpl-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("error.html");
        std::fs::write(&path, "<p>{ErrCode}: {ErrMessage}</p>").unwrap();

        let reporter = ErrorReporter::new(&ErrorConfig { nice: true, template: Some(path) });
        let (body, headers) = reporter.render(404);
        assert_eq!(body, b"<p>404: Not Found</p>");
        assert!(headers.iter().any(|(k, v)| k == "x-content-type-options" && v == "nosniff"));
        assert!(headers.iter().any(|(k, v)| k == "content-type" && v == "text/html; charset=utf-8"));
    }
}
