//! Scoped record templates.
//!
//! `create` without content renders the record body from a template.
//! Resolution is scoped: `.civic/templates/<type>.md`, falling back to
//! `.civic/templates/default.md`, falling back to a built-in skeleton.
//! Fragments under `.civic/partials/` are available to every template via
//! `{% include %}`.
//!
//! Template sources are cached under the `templates` cache, which the
//! container registers with a file-watcher strategy over both directories;
//! an edit to a template file invalidates on the next debounce tick.

use crate::cache::CacheManager;
use crate::error::Result;
use minijinja::Environment;
use std::path::PathBuf;

/// Cache name used for template sources.
pub const TEMPLATE_CACHE: &str = "templates";

const BUILTIN_TEMPLATE: &str = "# {{ title }}\n\nStatus: {{ status }}\n\n## Summary\n\n_Describe this {{ type }}._\n";

#[derive(Clone)]
pub struct TemplateEngine {
    templates_dir: PathBuf,
    partials_dir: PathBuf,
    cache: CacheManager,
}

impl TemplateEngine {
    pub fn new(civic_dir: &std::path::Path, cache: CacheManager) -> Self {
        TemplateEngine {
            templates_dir: civic_dir.join("templates"),
            partials_dir: civic_dir.join("partials"),
            cache,
        }
    }

    pub fn templates_dir(&self) -> &PathBuf {
        &self.templates_dir
    }

    pub fn partials_dir(&self) -> &PathBuf {
        &self.partials_dir
    }

    /// Renders the body for a new record of `record_type`.
    pub async fn render(
        &self,
        record_type: &str,
        context: &serde_json::Value,
    ) -> Result<String> {
        let source = self.resolve_source(record_type).await?;
        let partials = self.load_partials()?;

        let mut env = Environment::new();
        for (name, content) in &partials {
            env.add_template(name, content)?;
        }
        env.add_template("__record__", &source)?;

        let template = env.get_template("__record__")?;
        Ok(template.render(context)?)
    }

    /// Per-type template source with fallback chain, cached.
    async fn resolve_source(&self, record_type: &str) -> Result<String> {
        if let Some(cached) = self.cache.get(TEMPLATE_CACHE, record_type).await {
            if let Some(s) = cached.as_str() {
                return Ok(s.to_string());
            }
        }

        let candidates = [
            self.templates_dir.join(format!("{record_type}.md")),
            self.templates_dir.join("default.md"),
        ];

        let source = candidates
            .iter()
            .find(|p| p.is_file())
            .map(std::fs::read_to_string)
            .transpose()?
            .unwrap_or_else(|| BUILTIN_TEMPLATE.to_string());

        self.cache
            .insert(
                TEMPLATE_CACHE,
                record_type,
                serde_json::Value::String(source.clone()),
            )
            .await?;
        Ok(source)
    }

    fn load_partials(&self) -> Result<Vec<(String, String)>> {
        if !self.partials_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut partials = Vec::new();
        for entry in std::fs::read_dir(&self.partials_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                partials.push((name, std::fs::read_to_string(&path)?));
            }
        }
        Ok(partials)
    }
}
