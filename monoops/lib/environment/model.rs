use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize, Serializer};

use crate::MonoopsError;

use super::{hash_secret, is_hashed_secret, is_secret};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The purpose of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    /// Local development.
    Development,

    /// Pre-production.
    Staging,

    /// Live traffic.
    Production,

    /// Automated tests.
    Test,

    /// Anything else.
    Custom,
}

/// One variable inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVariable {
    /// The plaintext value, `None` for a secret whose plaintext is not available on this host.
    pub value: Option<String>,

    /// The stored form: plaintext for ordinary variables, a hash for secrets.
    pub stored: String,

    /// Whether the value is treated as a secret.
    pub secret: bool,

    /// Optional regex the value must match.
    pub validation: Option<String>,
}

/// A named variable and config-file bundle for a project.
#[derive(Debug, Clone, PartialEq, Getters, Setters)]
#[getset(get = "pub with_prefix")]
pub struct Environment {
    /// The environment name.
    name: String,

    /// The environment type.
    #[getset(set = "pub with_prefix")]
    env_type: EnvironmentType,

    /// The variables, keyed by name.
    variables: BTreeMap<String, EnvVariable>,

    /// Config files written on activation, keyed by path relative to the project.
    config_files: BTreeMap<String, String>,

    /// Whether this is the project's active environment.
    active: bool,

    /// When the environment was created.
    created_at: DateTime<Utc>,

    /// When the environment was last modified.
    updated_at: DateTime<Utc>,
}

/// The on-disk form of an environment; secret values are hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    /// The environment name.
    pub name: String,

    /// The environment type.
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,

    /// The variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDefinition>,

    /// Config file contents keyed by relative path.
    #[serde(default)]
    pub config_files: BTreeMap<String, String>,

    /// Whether this is the active environment.
    #[serde(default)]
    pub active: bool,

    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// The on-disk form of a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Plaintext, or `sha256:<hex>` for secrets.
    pub value: String,

    /// Whether the value is secret.
    #[serde(default)]
    pub secret: bool,

    /// Optional regex the value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvironmentType {
    /// Infers the type from a conventional environment name.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Self::Development,
            "staging" | "stage" | "preview" => Self::Staging,
            "production" | "prod" => Self::Production,
            "test" | "testing" | "ci" => Self::Test,
            _ => Self::Custom,
        }
    }
}

impl EnvVariable {
    /// Creates a variable from a plaintext value, classifying it as secret when it looks like one.
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        let secret = is_secret(key, &value);
        Self::with_secret(value, secret)
    }

    /// Creates a variable with an explicit secret flag.
    pub fn with_secret(value: impl Into<String>, secret: bool) -> Self {
        let value = value.into();
        let stored = if secret {
            hash_secret(&value)
        } else {
            value.clone()
        };

        Self {
            value: Some(value),
            stored,
            secret,
            validation: None,
        }
    }

    /// Whether `plaintext` is the value this variable stores.
    pub fn matches(&self, plaintext: &str) -> bool {
        if self.secret {
            self.stored == hash_secret(plaintext)
        } else {
            self.stored == plaintext
        }
    }
}

impl Environment {
    /// Creates an empty, inactive environment.
    pub fn new(name: impl Into<String>, env_type: EnvironmentType) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            env_type,
            variables: BTreeMap::new(),
            config_files: BTreeMap::new(),
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets or replaces a variable.
    pub fn set_variable(&mut self, key: impl Into<String>, variable: EnvVariable) {
        self.variables.insert(key.into(), variable);
        self.touch();
    }

    /// Sets or replaces a config file.
    pub fn set_config_file(&mut self, relative_path: impl Into<String>, contents: impl Into<String>) {
        self.config_files
            .insert(relative_path.into(), contents.into());
        self.touch();
    }

    /// Marks the environment active or inactive.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.active = active;
            self.touch();
        }
    }

    /// Returns the plaintext variables; secrets without known plaintext are omitted.
    pub fn plaintext_variables(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .filter_map(|(k, v)| v.value.clone().map(|value| (k.clone(), value)))
            .collect()
    }

    /// Names of secret variables whose plaintext is unavailable.
    pub fn unresolved_secrets(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(_, v)| v.value.is_none())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Converts to the on-disk form.
    pub fn to_definition(&self) -> EnvironmentDefinition {
        EnvironmentDefinition {
            name: self.name.clone(),
            env_type: self.env_type,
            variables: self
                .variables
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        VariableDefinition {
                            value: v.stored.clone(),
                            secret: v.secret,
                            validation: v.validation.clone(),
                        },
                    )
                })
                .collect(),
            config_files: self.config_files.clone(),
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Builds an environment from its on-disk form.
    ///
    /// Secret values stored as hashes have no plaintext until one is supplied from a variable file.
    /// Secret values stored in plaintext (hand-edited files) are kept and re-hashed on next save.
    pub fn from_definition(definition: EnvironmentDefinition) -> Self {
        let variables = definition
            .variables
            .into_iter()
            .map(|(k, v)| {
                let variable = if v.secret && is_hashed_secret(&v.value) {
                    EnvVariable {
                        value: None,
                        stored: v.value,
                        secret: true,
                        validation: v.validation,
                    }
                } else {
                    let mut variable = EnvVariable::with_secret(v.value, v.secret);
                    variable.validation = v.validation;
                    variable
                };
                (k, variable)
            })
            .collect();

        Self {
            name: definition.name,
            env_type: definition.env_type,
            variables,
            config_files: definition.config_files,
            active: definition.active,
            created_at: definition.created_at,
            updated_at: definition.updated_at,
        }
    }

    /// Supplies plaintext from a flat variable file.
    ///
    /// Known secrets take the plaintext only when it matches the stored hash. Unknown keys are added
    /// and classified.
    pub fn merge_plaintext(&mut self, key: &str, value: &str) {
        match self.variables.get_mut(key) {
            Some(existing) if existing.value.is_none() => {
                if existing.matches(value) {
                    existing.value = Some(value.to_string());
                } else {
                    tracing::warn!(
                        environment = %self.name,
                        key,
                        "variable file value does not match stored secret hash, ignoring"
                    );
                }
            }
            Some(_) => {}
            None => {
                self.variables
                    .insert(key.to_string(), EnvVariable::new(key, value));
            }
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_definition().serialize(serializer)
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Test => "test",
            Self::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EnvironmentType {
    type Err = MonoopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            "custom" => Ok(Self::Custom),
            other => Err(MonoopsError::Validation(format!(
                "unknown environment type: {}",
                other
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_never_holds_secret_plaintext() {
        let mut env = Environment::new("production", EnvironmentType::Production);
        env.set_variable("DB_PASSWORD", EnvVariable::new("DB_PASSWORD", "hunter2"));
        env.set_variable("PORT", EnvVariable::new("PORT", "8080"));

        let yaml = serde_yaml::to_string(&env).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(yaml.contains("8080"));

        let restored = Environment::from_definition(env.to_definition());
        assert_eq!(restored.unresolved_secrets(), vec!["DB_PASSWORD".to_string()]);
        assert_eq!(
            restored.plaintext_variables().get("PORT").map(String::as_str),
            Some("8080")
        );
    }

    #[test]
    fn test_merge_plaintext_restores_matching_secret() {
        let mut env = Environment::new("production", EnvironmentType::Production);
        env.set_variable("API_TOKEN", EnvVariable::new("API_TOKEN", "abc"));
        let mut restored = Environment::from_definition(env.to_definition());

        restored.merge_plaintext("API_TOKEN", "wrong");
        assert!(restored.plaintext_variables().get("API_TOKEN").is_none());

        restored.merge_plaintext("API_TOKEN", "abc");
        assert_eq!(
            restored.plaintext_variables().get("API_TOKEN").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn test_environment_type_from_name() {
        assert_eq!(EnvironmentType::from_name("prod"), EnvironmentType::Production);
        assert_eq!(EnvironmentType::from_name("qa-7"), EnvironmentType::Custom);
        assert!("nope".parse::<EnvironmentType>().is_err());
    }
}
