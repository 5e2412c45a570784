use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeType;

/// Value returned in place of a secret env var on every read path.
pub const SECRET_MASK: &str = "********";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Idle,
    Deploying,
    Running,
    Error,
    Redeploying,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Error => "error",
            Self::Redeploying => "redeploying",
        }
    }

    /// A pipeline currently owns the application.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Deploying | Self::Redeploying)
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "redeploying" => Ok(Self::Redeploying),
            _ => Err(format!("Invalid app status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    /// Empty until detection has run
    pub language: String,
    pub port: u16,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub status: AppStatus,
    pub error_message: Option<String>,
    pub runtime_type: RuntimeType,
    pub created_at: String,
    pub updated_at: String,
}

impl Application {
    /// A fresh, idle application. Timestamps are filled in by the store.
    pub fn new(
        id: &str,
        name: &str,
        repo_url: &str,
        language: &str,
        port: u16,
        runtime_type: RuntimeType,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            language: language.to_string(),
            port,
            container_id: None,
            image_id: None,
            status: AppStatus::Idle,
            error_message: None,
            runtime_type,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub app_id: String,
    pub key: String,
    /// Ciphertext when `is_secret`
    pub value: String,
    pub is_secret: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl EnvVar {
    /// Copy safe to return to clients.
    pub fn masked(mut self) -> Self {
        if self.is_secret {
            self.value = SECRET_MASK.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_status_round_trip() {
        for s in [
            AppStatus::Idle,
            AppStatus::Deploying,
            AppStatus::Running,
            AppStatus::Error,
            AppStatus::Redeploying,
        ] {
            assert_eq!(s.as_str().parse::<AppStatus>().unwrap(), s);
        }
        assert!("paused".parse::<AppStatus>().is_err());
    }

    #[test]
    fn test_app_status_serde() {
        let json = serde_json::to_string(&AppStatus::Redeploying).unwrap();
        assert_eq!(json, "\"redeploying\"");
    }

    #[test]
    fn test_masked() {
        let var = EnvVar {
            app_id: "app_1_1".into(),
            key: "API_TOKEN".into(),
            value: "ciphertext".into(),
            is_secret: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(var.clone().masked().value, SECRET_MASK);
        let plain = EnvVar {
            is_secret: false,
            ..var
        };
        assert_eq!(plain.masked().value, "ciphertext");
    }
}
