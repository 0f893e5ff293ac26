//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;

/// 默认租户标识，未指定租户的规则对所有租户生效
pub const DEFAULT_TENANT: &str = "All_Tenants";

/// 默认区域标识
pub const DEFAULT_CULTURE: &str = "en-GB";

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 未显式指定租户时使用的租户 ID
    pub default_tenant: String,
    /// 未显式指定区域时使用的区域 ID
    pub default_culture: String,
    /// 缓存按键加锁的最长等待时间（毫秒），超时视为该次调用失败
    pub cache_lock_timeout_ms: u64,
    /// 发布事件时是否同时向外部解析器请求处理器
    pub resolve_external_event_handlers: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_tenant: DEFAULT_TENANT.to_string(),
            default_culture: DEFAULT_CULTURE.to_string(),
            cache_lock_timeout_ms: 5_000,
            resolve_external_event_handlers: false,
        }
    }
}

impl EngineSettings {
    /// 缓存锁等待上限
    pub fn cache_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_lock_timeout_ms)
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineSettings,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（RULES_ 前缀，双下划线分隔层级，如 RULES_ENGINE__DEFAULT_TENANT -> engine.default_tenant）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("RULES_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, service_name: &str, env: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            // 单下划线保留给字段名本身（default_tenant），层级之间用双下划线
            .add_source(
                Environment::with_prefix("RULES")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        if config.observability.service_name.is_empty() {
            config.observability.service_name = config.service_name.clone();
        }

        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.default_tenant, "All_Tenants");
        assert_eq!(settings.default_culture, "en-GB");
        assert_eq!(settings.cache_lock_timeout(), Duration::from_secs(5));
        assert!(!settings.resolve_external_event_handlers);
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let dir = std::env::temp_dir().join("rules-shared-missing-config-dir");
        let config = AppConfig::load_from(&dir, "rule-engine", "test").unwrap();

        assert_eq!(config.service_name, "rule-engine");
        assert_eq!(config.environment, "test");
        assert_eq!(config.engine.default_culture, "en-GB");
        assert_eq!(config.observability.service_name, "rule-engine");
        assert!(!config.is_production());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("rules-shared-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            r#"
            [engine]
            default_tenant = "tenant-a"
            cache_lock_timeout_ms = 250
            resolve_external_event_handlers = true

            [observability]
            log_level = "debug"
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(&dir, "rule-engine", "production").unwrap();

        assert_eq!(config.engine.default_tenant, "tenant-a");
        // 未覆盖的字段保持默认值
        assert_eq!(config.engine.default_culture, "en-GB");
        assert_eq!(config.engine.cache_lock_timeout(), Duration::from_millis(250));
        assert!(config.engine.resolve_external_event_handlers);
        assert_eq!(config.observability.log_level, "debug");
        assert!(config.is_production());

        std::fs::remove_dir_all(&dir).ok();
    }
}
