//! Language templates: how to build and run an application per language.
//!
//! Two registries exist. The Docker registry holds Dockerfile bodies (also
//! used for containerd), the LXC registry holds shell setup scripts run
//! inside a fresh container. Both share placeholder syntax:
//!
//! | placeholder        | value                                  |
//! |--------------------|----------------------------------------|
//! | `{{APP_NAME}}`     | application name                       |
//! | `{{APP_ID}}`       | application id                         |
//! | `{{PORT}}`         | container port                         |
//! | `{{REPO_URL}}`     | repository URL, without credentials    |
//! | `{{FETCH_SOURCE}}` | step that puts the source in place     |
//! | `{{WORKDIR}}`      | template working directory             |
//! | `{{BASE_IMAGE}}`   | template base image                    |
//! | `{{ENV}}`          | merged environment, one line per entry |
//!
//! Values land in shell contexts, so the LXC engine single-quotes names and
//! URLs. Credentials never appear in a rendered body: Docker builds copy a
//! host checkout from the build context, LXC scripts read the token from
//! [`GIT_TOKEN_VAR`] at run time.

mod docker;
mod lxc;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::TemplateError;
use crate::runtime::{CONTEXT_SOURCE_DIR, RuntimeType};

pub const GENERIC: &str = "generic";

/// Value of the `managed-by` label on everything diplo creates.
pub const MANAGED_BY: &str = "diplo";

/// Variable holding the clone token while an LXC setup script runs.
pub const GIT_TOKEN_VAR: &str = "DIPLO_GIT_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub language: String,
    pub base_image: String,
    #[serde(default)]
    pub build_steps: Vec<String>,
    pub port: u16,
    pub workdir: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Docker,
    Lxc,
}

impl TemplateKind {
    pub fn for_runtime(runtime_type: RuntimeType) -> Self {
        match runtime_type {
            RuntimeType::Docker | RuntimeType::Containerd => Self::Docker,
            RuntimeType::Lxc => Self::Lxc,
        }
    }

    fn env_line(&self, key: &str, value: &str) -> String {
        match self {
            Self::Docker => format!("ENV {}=\"{}\"", key, value.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::Lxc => format!("export {}={}", key, shell_quote(value)),
        }
    }

    fn app_name(&self, name: &str) -> String {
        match self {
            Self::Docker => name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
                .collect(),
            Self::Lxc => shell_quote(name),
        }
    }

    fn repo_url(&self, url: &str) -> String {
        match self {
            Self::Docker => url.to_string(),
            Self::Lxc => shell_quote(url),
        }
    }

    fn fetch_source(&self, params: &RenderParams, workdir: &str) -> String {
        let url = shell_quote(&params.repo_url);
        match (self, params.source) {
            (Self::Docker, SourceAccess::Context) => format!("COPY {}/ .", CONTEXT_SOURCE_DIR),
            (Self::Docker, _) => format!("RUN git clone --depth 1 {} .", url),
            (Self::Lxc, SourceAccess::Token) if params.repo_url.starts_with("https://") => {
                let rest = &params.repo_url["https://".len()..];
                let dest = shell_quote(workdir);
                format!(
                    "git clone --depth 1 \"https://${{{}}}@{}\" {}\ngit -C {} remote set-url origin {}",
                    GIT_TOKEN_VAR,
                    double_quote_escape(rest),
                    dest,
                    dest,
                    url
                )
            }
            (Self::Lxc, _) => format!("git clone --depth 1 {} {}", url, shell_quote(workdir)),
        }
    }
}

/// How a rendered body obtains the application source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceAccess {
    /// Anonymous clone of the repository URL
    #[default]
    Public,
    /// Clone authenticated through [`GIT_TOKEN_VAR`] (LXC scripts)
    Token,
    /// Copy of the host checkout shipped in the build context (Docker)
    Context,
}

/// Single-quote `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Replace `{{NAME}}` tokens in one pass. Substituted text is not scanned
/// again; unknown tokens are kept verbatim.
fn substitute(body: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let token = &rest[start + 2..];
        match token
            .find("}}")
            .and_then(|end| values.get(&token[..end]).map(|value| (end, value)))
        {
            Some((end, value)) => {
                out.push_str(value);
                rest = &token[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = token;
            }
        }
    }
    out.push_str(rest);
    out
}

fn double_quote_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Caller-supplied rendering inputs.
#[derive(Debug, Clone, Default)]
pub struct RenderParams {
    pub app_name: String,
    pub app_id: String,
    pub port: u16,
    /// Repository URL without credentials
    pub repo_url: String,
    pub source: SourceAccess,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// A template rendered for one application.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub language: String,
    pub base_image: String,
    pub workdir: String,
    pub command: Vec<String>,
    pub port: u16,
    pub body: String,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// Map aliases onto canonical language names.
pub fn normalize_language(language: &str) -> String {
    let lower = language.trim().to_lowercase();
    match lower.as_str() {
        "js" | "nodejs" | "node" => "javascript".to_string(),
        "py" | "python3" => "python".to_string(),
        "golang" => "go".to_string(),
        "rs" => "rust".to_string(),
        "rb" => "ruby".to_string(),
        _ => lower,
    }
}

pub struct TemplateRegistry {
    kind: TemplateKind,
    templates: RwLock<BTreeMap<String, Template>>,
}

impl TemplateRegistry {
    fn with_builtins(kind: TemplateKind, builtins: Vec<Template>) -> Self {
        let templates = builtins
            .into_iter()
            .map(|t| (t.language.clone(), t))
            .collect();
        Self {
            kind,
            templates: RwLock::new(templates),
        }
    }

    /// Registry of Dockerfile templates.
    pub fn docker() -> Self {
        Self::with_builtins(TemplateKind::Docker, docker::builtin())
    }

    /// Registry of LXC setup-script templates.
    pub fn lxc() -> Self {
        Self::with_builtins(TemplateKind::Lxc, lxc::builtin())
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Template>> {
        self.templates.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Template>> {
        self.templates.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Template for `language`, falling back to `generic`.
    pub fn get(&self, language: &str) -> Template {
        let key = normalize_language(language);
        let templates = self.read();
        if let Some(t) = templates.get(&key) {
            return t.clone();
        }
        debug!(language, "No template, using generic");
        templates
            .get(GENERIC)
            .cloned()
            .unwrap_or_else(|| generic_fallback(self.kind))
    }

    /// Exact lookup without fallback.
    pub fn find(&self, language: &str) -> Option<Template> {
        self.read().get(&normalize_language(language)).cloned()
    }

    pub fn render(&self, language: &str, params: &RenderParams) -> Rendered {
        let template = self.get(language);

        let mut environment = template.environment.clone();
        environment.extend(params.environment.clone());

        let mut labels = template.labels.clone();
        labels.extend(params.labels.clone());
        labels.insert("app.id".to_string(), params.app_id.clone());
        labels.insert("app.name".to_string(), params.app_name.clone());
        labels.insert("managed-by".to_string(), MANAGED_BY.to_string());

        let mut keys: Vec<&String> = environment.keys().collect();
        keys.sort();
        let env_block = keys
            .into_iter()
            .map(|k| self.kind.env_line(k, &environment[k]))
            .collect::<Vec<_>>()
            .join("\n");

        let values = HashMap::from([
            ("APP_NAME", self.kind.app_name(&params.app_name)),
            ("APP_ID", params.app_id.clone()),
            ("PORT", params.port.to_string()),
            ("REPO_URL", self.kind.repo_url(&params.repo_url)),
            ("FETCH_SOURCE", self.kind.fetch_source(params, &template.workdir)),
            ("WORKDIR", template.workdir.clone()),
            ("BASE_IMAGE", template.base_image.clone()),
            ("ENV", env_block),
        ]);
        let body = substitute(&template.body, &values);

        Rendered {
            language: template.language,
            base_image: template.base_image,
            workdir: template.workdir,
            command: template.command,
            port: params.port,
            body,
            environment,
            labels,
        }
    }

    pub fn validate(&self, template: &Template) -> Result<(), TemplateError> {
        let lang = &template.language;
        if lang.is_empty()
            || !lang
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(TemplateError::Invalid(format!(
                "language must be lowercase [a-z0-9_-]+, got '{}'",
                lang
            )));
        }
        if template.base_image.trim().is_empty() {
            return Err(TemplateError::Invalid("base_image is required".into()));
        }
        if template.port == 0 {
            return Err(TemplateError::Invalid("port must be non-zero".into()));
        }
        if template.workdir.trim().is_empty() || !template.workdir.starts_with('/') {
            return Err(TemplateError::Invalid("workdir must be an absolute path".into()));
        }
        if template.body.trim().is_empty() {
            return Err(TemplateError::Invalid("body is required".into()));
        }
        if self.kind == TemplateKind::Docker
            && !template
                .body
                .lines()
                .any(|l| l.trim_start().to_uppercase().starts_with("FROM "))
        {
            return Err(TemplateError::Invalid(
                "Dockerfile body needs a FROM instruction".into(),
            ));
        }
        Ok(())
    }

    pub fn add(&self, template: Template) -> Result<(), TemplateError> {
        self.validate(&template)?;
        let mut templates = self.write();
        if templates.contains_key(&template.language) {
            return Err(TemplateError::Exists(template.language));
        }
        templates.insert(template.language.clone(), template);
        Ok(())
    }

    pub fn update(&self, template: Template) -> Result<(), TemplateError> {
        self.validate(&template)?;
        let mut templates = self.write();
        match templates.get_mut(&template.language) {
            Some(existing) => {
                *existing = template;
                Ok(())
            }
            None => Err(TemplateError::NotFound(template.language)),
        }
    }

    pub fn delete(&self, language: &str) -> Result<(), TemplateError> {
        let key = normalize_language(language);
        if key == GENERIC {
            return Err(TemplateError::Protected);
        }
        match self.write().remove(&key) {
            Some(_) => Ok(()),
            None => Err(TemplateError::NotFound(key)),
        }
    }

    /// Supported languages, sorted, without `generic`.
    pub fn languages(&self) -> Vec<String> {
        self.read()
            .keys()
            .filter(|k| k.as_str() != GENERIC)
            .cloned()
            .collect()
    }

    /// Distinct base images, sorted.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.read().values().map(|t| t.base_image.clone()).collect();
        images.sort();
        images.dedup();
        images
    }

    pub fn list(&self) -> Vec<Template> {
        self.read().values().cloned().collect()
    }
}

/// Both registries, picked per backend.
pub struct Templates {
    pub docker: TemplateRegistry,
    pub lxc: TemplateRegistry,
}

impl Templates {
    pub fn builtin() -> Self {
        Self {
            docker: TemplateRegistry::docker(),
            lxc: TemplateRegistry::lxc(),
        }
    }

    pub fn for_runtime(&self, runtime_type: RuntimeType) -> &TemplateRegistry {
        match TemplateKind::for_runtime(runtime_type) {
            TemplateKind::Docker => &self.docker,
            TemplateKind::Lxc => &self.lxc,
        }
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::builtin()
    }
}

fn generic_fallback(kind: TemplateKind) -> Template {
    warn!(?kind, "Generic template missing from registry, using built-in");
    let builtins = match kind {
        TemplateKind::Docker => docker::builtin(),
        TemplateKind::Lxc => lxc::builtin(),
    };
    builtins
        .into_iter()
        .find(|t| t.language == GENERIC)
        .unwrap_or_else(|| Template {
            language: GENERIC.to_string(),
            base_image: "ubuntu:22.04".to_string(),
            build_steps: Vec::new(),
            port: 8080,
            workdir: "/app".to_string(),
            command: Vec::new(),
            environment: HashMap::new(),
            labels: HashMap::new(),
            body: "FROM {{BASE_IMAGE}}\n".to_string(),
        })
}

pub(crate) fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RenderParams {
        RenderParams {
            app_name: "hello".into(),
            app_id: "app_1_2".into(),
            port: 4321,
            repo_url: "https://github.com/acme/hello.git".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_language("NodeJS"), "javascript");
        assert_eq!(normalize_language("node"), "javascript");
        assert_eq!(normalize_language("py"), "python");
        assert_eq!(normalize_language("python3"), "python");
        assert_eq!(normalize_language("golang"), "go");
        assert_eq!(normalize_language("rs"), "rust");
        assert_eq!(normalize_language("rb"), "ruby");
        assert_eq!(normalize_language(" Java "), "java");
    }

    #[test]
    fn test_every_builtin_language_has_both_engines() {
        let templates = Templates::builtin();
        let expected = ["go", "java", "javascript", "php", "python", "ruby", "rust"];
        assert_eq!(templates.docker.languages(), expected);
        assert_eq!(templates.lxc.languages(), expected);
        for t in templates.docker.list() {
            templates.docker.validate(&t).unwrap();
        }
        for t in templates.lxc.list() {
            templates.lxc.validate(&t).unwrap();
        }
    }

    #[test]
    fn test_get_falls_back_to_generic() {
        let reg = TemplateRegistry::docker();
        assert_eq!(reg.get("cobol").language, GENERIC);
        assert_eq!(reg.get("js").language, "javascript");
        assert!(reg.find("cobol").is_none());
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let reg = TemplateRegistry::docker();
        let rendered = reg.render("go", &params());
        assert!(rendered.body.contains("RUN git clone --depth 1 'https://github.com/acme/hello.git' ."));
        assert!(rendered.body.contains("EXPOSE 4321"));
        assert!(!rendered.body.contains("{{"));
        assert_eq!(rendered.port, 4321);
    }

    #[test]
    fn test_render_env_merge_caller_wins() {
        let reg = TemplateRegistry::docker();
        let mut p = params();
        p.environment.insert("NODE_ENV".into(), "staging".into());
        p.environment.insert("GREETING".into(), "say \"hi\"".into());
        let rendered = reg.render("javascript", &p);
        assert_eq!(rendered.environment["NODE_ENV"], "staging");
        assert!(rendered.body.contains("ENV NODE_ENV=\"staging\""));
        assert!(rendered.body.contains("ENV GREETING=\"say \\\"hi\\\"\""));
    }

    #[test]
    fn test_render_lxc_env_lines_are_exports() {
        let reg = TemplateRegistry::lxc();
        let mut p = params();
        p.environment.insert("QUOTE".into(), "it's".into());
        let rendered = reg.render("python", &p);
        assert!(rendered.body.contains("export QUOTE='it'\\''s'"));
        assert!(rendered.body.contains("https://github.com/acme/hello.git"));
    }

    #[test]
    fn test_lxc_quotes_name_and_url() {
        let reg = TemplateRegistry::lxc();
        let p = RenderParams {
            app_name: "x\"; touch /pwned; echo \"".into(),
            repo_url: "https://h/r.git;id".into(),
            ..params()
        };
        let rendered = reg.render("go", &p);
        assert!(
            rendered
                .body
                .contains("git clone --depth 1 'https://h/r.git;id' '/app'")
        );
        assert!(
            rendered
                .body
                .contains("echo 'x\"; touch /pwned; echo \"' started on port 4321")
        );
        assert!(!rendered.body.lines().any(|l| l.starts_with("touch")));
    }

    #[test]
    fn test_docker_name_keeps_safe_characters() {
        let reg = TemplateRegistry::docker();
        let p = RenderParams {
            app_name: "web'; rm -rf /\"".into(),
            ..params()
        };
        let rendered = reg.render("generic", &p);
        assert!(rendered.body.contains("no start command for webrm-rf"));
        assert_eq!(rendered.labels["app.name"], p.app_name);
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let reg = TemplateRegistry::lxc();
        let mut p = params();
        p.environment.insert("TEMPLATE".into(), "{{FETCH_SOURCE}}".into());
        let rendered = reg.render("python", &p);
        assert!(rendered.body.contains("export TEMPLATE='{{FETCH_SOURCE}}'"));
        assert_eq!(rendered.body.matches("git clone").count(), 1);
    }

    #[test]
    fn test_token_source_never_embeds_credentials() {
        let lxc = TemplateRegistry::lxc().render(
            "go",
            &RenderParams {
                source: SourceAccess::Token,
                ..params()
            },
        );
        assert!(lxc.body.contains(
            "git clone --depth 1 \"https://${DIPLO_GIT_TOKEN}@github.com/acme/hello.git\" '/app'"
        ));
        assert!(
            lxc.body
                .contains("git -C '/app' remote set-url origin 'https://github.com/acme/hello.git'")
        );

        let docker = TemplateRegistry::docker().render(
            "go",
            &RenderParams {
                source: SourceAccess::Context,
                ..params()
            },
        );
        assert!(docker.body.contains("COPY source/ ."));
        assert!(!docker.body.contains("git clone"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(double_quote_escape("a$b`c\"d\\"), "a\\$b\\`c\\\"d\\\\");
    }

    #[test]
    fn test_labels_injected_last() {
        let reg = TemplateRegistry::docker();
        let mut p = params();
        p.labels.insert("managed-by".into(), "someone-else".into());
        p.labels.insert("team".into(), "web".into());
        let rendered = reg.render("rust", &p);
        assert_eq!(rendered.labels["managed-by"], MANAGED_BY);
        assert_eq!(rendered.labels["app.id"], "app_1_2");
        assert_eq!(rendered.labels["app.name"], "hello");
        assert_eq!(rendered.labels["team"], "web");
    }

    #[test]
    fn test_add_update_delete() {
        let reg = TemplateRegistry::docker();
        let mut t = reg.get("go");
        t.language = "elixir".into();
        t.base_image = "elixir:1.17".into();

        reg.add(t.clone()).unwrap();
        assert_eq!(reg.add(t.clone()), Err(TemplateError::Exists("elixir".into())));
        assert!(reg.languages().contains(&"elixir".to_string()));
        assert!(reg.images().contains(&"elixir:1.17".to_string()));

        t.port = 4000;
        reg.update(t.clone()).unwrap();
        assert_eq!(reg.get("elixir").port, 4000);

        reg.delete("elixir").unwrap();
        assert_eq!(reg.delete("elixir"), Err(TemplateError::NotFound("elixir".into())));
        assert_eq!(reg.delete("generic"), Err(TemplateError::Protected));

        t.language = "zig".into();
        assert_eq!(reg.update(t), Err(TemplateError::NotFound("zig".into())));
    }

    #[test]
    fn test_validate_rejects_bad_templates() {
        let reg = TemplateRegistry::docker();
        let mut t = reg.get("go");
        t.body = "RUN echo no base\n".into();
        assert!(matches!(reg.validate(&t), Err(TemplateError::Invalid(_))));

        let mut t = reg.get("go");
        t.language = "Go Lang".into();
        assert!(reg.validate(&t).is_err());

        let mut t = reg.get("go");
        t.port = 0;
        assert!(reg.validate(&t).is_err());

        let mut t = reg.get("go");
        t.workdir = "app".into();
        assert!(reg.validate(&t).is_err());
    }

    #[test]
    fn test_for_runtime() {
        let templates = Templates::builtin();
        assert_eq!(templates.for_runtime(RuntimeType::Lxc).kind(), TemplateKind::Lxc);
        assert_eq!(
            templates.for_runtime(RuntimeType::Containerd).kind(),
            TemplateKind::Docker
        );
    }
}
