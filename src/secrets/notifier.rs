//! Notifier credential configs whose secrets are managed by [`super::SecretMigrator`]

use serde::{Deserialize, Serialize};

/// SMTP notifier settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmtpConfig {
    /// Mail server host
    pub host: String,
    /// Mail server port
    pub port: u16,
    /// Login user
    #[serde(default)]
    pub username: String,
    /// Login password, the stored credential
    #[serde(default)]
    pub password: String,
    /// From address
    pub sender: String,
}

/// WeChat Work notifier settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WechatConfig {
    /// Corporation ID
    pub corp: String,
    /// Application agent ID
    pub agent: String,
    /// Application secret, the stored credential
    #[serde(default)]
    pub secret: String,
}

/// DingTalk notifier settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DingtalkConfig {
    /// Robot webhook URL
    pub url: String,
    /// Signing secret, the stored credential
    #[serde(default)]
    pub secret: String,
}
