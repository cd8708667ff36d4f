#[cfg(feature = "aws")]
pub mod ssm;

use anyhow::Result;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::LazyLock;

const CONFIG_FILES: &[&str] = &["config/config.yaml", "config/config.local.yaml"];

/// `${NAME}` or `${NAME:default}` placeholders inside string values.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_\-]+)(?::([^}]*))?\}").expect("invalid placeholder regex")
});

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gin: GinConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dynamodb: DynamoDbConfig,
    pub google: GoogleConfig,
    #[serde(default)]
    pub allow: AllowConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ssm: SsmConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Debug,
    Test,
    Release,
}

impl RunMode {
    /// Release builds always send cookies with `Secure` and `HttpOnly`.
    pub fn is_release(self) -> bool {
        self == RunMode::Release
    }

    pub fn hydrates_parameters(self) -> bool {
        matches!(self, RunMode::Test | RunMode::Release)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    /// Alias for `gin.mode`, which wins when both are set.
    #[serde(default)]
    pub mode: Option<RunMode>,
}

impl ServerConfig {
    fn default_port() -> u16 {
        8080
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            mode: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GinConfig {
    #[serde(default)]
    pub mode: Option<RunMode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Memory,
    File,
    Dynamodb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub backend: SessionBackend,
    #[serde(default = "SessionConfig::default_file_path")]
    pub file_path: String,
    #[serde(default = "SessionConfig::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    fn default_file_path() -> String {
        "data/sessions.json".to_owned()
    }

    fn default_sweep_interval_secs() -> u64 {
        300
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            file_path: Self::default_file_path(),
            sweep_interval_secs: Self::default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    #[serde(default = "DynamoDbConfig::default_region")]
    pub region: String,
    #[serde(default = "DynamoDbConfig::default_table")]
    pub table: String,
    #[serde(default)]
    pub local: Option<DynamoDbLocalConfig>,
}

impl DynamoDbConfig {
    fn default_region() -> String {
        "us-east-1".to_owned()
    }

    fn default_table() -> String {
        "Sessions".to_owned()
    }
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            region: Self::default_region(),
            table: Self::default_table(),
            local: None,
        }
    }
}

/// Points the store client at a local emulator instead of AWS.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DynamoDbLocalConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub access_key_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub oauth2: OAuth2Credentials,
    #[serde(default)]
    pub endpoints: GoogleEndpoints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2Credentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleEndpoints {
    #[serde(default = "GoogleEndpoints::default_token_url")]
    pub token_url: String,
    #[serde(default = "GoogleEndpoints::default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "GoogleEndpoints::default_people_url")]
    pub people_url: String,
    #[serde(default = "GoogleEndpoints::default_calendar_api_base")]
    pub calendar_api_base: String,
}

impl GoogleEndpoints {
    fn default_token_url() -> String {
        "https://oauth2.googleapis.com/token".to_owned()
    }

    fn default_userinfo_url() -> String {
        "https://www.googleapis.com/oauth2/v2/userinfo".to_owned()
    }

    fn default_people_url() -> String {
        "https://people.googleapis.com/v1/people/me".to_owned()
    }

    fn default_calendar_api_base() -> String {
        "https://www.googleapis.com/calendar/v3".to_owned()
    }
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            token_url: Self::default_token_url(),
            userinfo_url: Self::default_userinfo_url(),
            people_url: Self::default_people_url(),
            calendar_api_base: Self::default_calendar_api_base(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowConfig {
    #[serde(default)]
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_owned()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SsmConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Config key (`google.oauth2.client_secret`) to SSM parameter name.
    #[serde(default, deserialize_with = "flatten_mappings")]
    pub mappings: HashMap<String, String>,
}

/// A mapping key such as `google.oauth2.client_id` may arrive either verbatim
/// or split into nested tables; both collapse to the dotted form.
#[derive(Deserialize)]
#[serde(untagged)]
enum MappingNode {
    Parameter(String),
    Nested(HashMap<String, MappingNode>),
}

fn flatten_mappings<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn walk(prefix: &str, node: MappingNode, out: &mut HashMap<String, String>) {
        match node {
            MappingNode::Parameter(parameter) => {
                out.insert(prefix.to_owned(), parameter);
            }
            MappingNode::Nested(children) => {
                for (key, child) in children {
                    let key = if prefix.is_empty() {
                        key
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&key, child, out);
                }
            }
        }
    }

    let roots = Option::<HashMap<String, MappingNode>>::deserialize(deserializer)?;
    let mut out = HashMap::new();
    for (key, node) in roots.unwrap_or_default() {
        walk(&key, node, &mut out);
    }
    Ok(out)
}

impl AppConfig {
    pub async fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let base = Self::resolve(Self::builder()?, |name| std::env::var(name).ok())?;
        let cfg: AppConfig = base.clone().try_deserialize()?;
        if !cfg.mode().hydrates_parameters() {
            return Ok(cfg);
        }

        Self::hydrate(base, cfg).await
    }

    /// Effective run mode: `gin.mode`, then `server.mode`, then debug.
    pub fn mode(&self) -> RunMode {
        self.gin.mode.or(self.server.mode).unwrap_or_default()
    }

    #[cfg(feature = "aws")]
    async fn hydrate(base: Config, cfg: AppConfig) -> Result<Self> {
        let overrides = ssm::fetch_parameters(&cfg.ssm).await?;
        if overrides.is_empty() {
            return Ok(cfg);
        }

        let mut builder = Config::builder().add_source(base);
        for (key, value) in overrides {
            builder = builder.set_override(key, value)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    #[cfg(not(feature = "aws"))]
    async fn hydrate(_base: Config, cfg: AppConfig) -> Result<Self> {
        if !cfg.ssm.mappings.is_empty() {
            tracing::warn!("ssm mappings configured but the binary was built without `aws`; skipping");
        }
        Ok(cfg)
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder();
        for path in CONFIG_FILES {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(false));
        }

        Ok(builder.add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("allow.origins")
                .try_parsing(true),
        ))
    }

    /// Parses every source, then expands placeholders inside the parsed string
    /// values so substituted text is never read as YAML.
    fn resolve<F>(builder: ConfigBuilder<DefaultState>, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tree: serde_json::Value = builder.build()?.try_deserialize()?;
        let tree = substitute_tree(tree, &lookup);
        Ok(Config::try_from(&tree)?)
    }
}

/// Applies [`substitute_env`] to every string in the tree, list items included.
fn substitute_tree<F>(value: serde_json::Value, lookup: &F) -> serde_json::Value
where
    F: Fn(&str) -> Option<String>,
{
    use serde_json::Value;

    match value {
        Value::String(raw) => Value::String(substitute_env(&raw, lookup)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute_tree(item, lookup))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, item)| (key, substitute_tree(item, lookup)))
                .collect(),
        ),
        other => other,
    }
}

/// Replaces `${NAME:default}` placeholders. A set, non-empty variable wins over
/// the default; with neither the placeholder becomes an empty string.
pub fn substitute_env<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            lookup(&caps[1])
                .filter(|value| !value.is_empty())
                .or_else(|| caps.get(2).map(|default| default.as_str().to_owned()))
                .unwrap_or_default()
        })
        .into_owned()
}
