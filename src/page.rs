//! The holding page served while a workload starts.
//!
//! The page is a parameter of the engine: a UTF-8 HTML template with
//! two placeholder tokens, substituted by literal replacement. The
//! built-in template refreshes itself and eventually redirects; an
//! operator can supply their own file instead.

use std::sync::Arc;

pub const REDIRECT_URL_TOKEN: &str = "{{REDIRECT_URL}}";
pub const CONTAINER_NAME_TOKEN: &str = "{{CONTAINER_NAME}}";

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Starting {{CONTAINER_NAME}}&hellip;</title>
  <style>
    body { font-family: system-ui, sans-serif; background: #10151b; color: #e8edf2;
           display: flex; align-items: center; justify-content: center;
           height: 100vh; margin: 0; }
    main { text-align: center; }
    .spinner { width: 48px; height: 48px; margin: 0 auto 24px;
               border: 4px solid #2d3a48; border-top-color: #5bc0eb;
               border-radius: 50%; animation: spin 1s linear infinite; }
    @keyframes spin { to { transform: rotate(360deg); } }
    p { color: #8fa1b3; }
  </style>
</head>
<body>
  <main>
    <div class="spinner"></div>
    <h1>Waking up {{CONTAINER_NAME}}</h1>
    <p>This page refreshes automatically while the service starts.</p>
  </main>
  <script>
    setTimeout(function () { window.location = "{{REDIRECT_URL}}"; }, 30000);
  </script>
</body>
</html>
"#;

/// A cheaply cloneable holding-page template.
#[derive(Debug, Clone)]
pub struct HoldingPage {
    template: Arc<String>,
}

impl Default for HoldingPage {
    fn default() -> Self {
        Self::built_in()
    }
}

impl HoldingPage {
    pub fn built_in() -> Self {
        Self {
            template: Arc::new(DEFAULT_TEMPLATE.to_string()),
        }
    }

    pub fn from_template(template: String) -> Self {
        Self {
            template: Arc::new(template),
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let template = std::fs::read_to_string(path)?;
        Ok(Self::from_template(template))
    }

    /// Substitute every occurrence of both tokens.
    pub fn render(&self, container_name: &str, redirect_url: &str) -> String {
        self.template
            .replace(REDIRECT_URL_TOKEN, redirect_url)
            .replace(CONTAINER_NAME_TOKEN, container_name)
    }
}
