//! # config 模块说明
//!
//! ## 意图（Why）
//! - 网络插件运行在宿主进程内，无法接收命令行参数；所有可调项都通过环境变量或一个可选的
//!   TOML 文件注入，本模块负责把它们收敛为强类型的 [`NetConfig`]；
//! - 读取环境变量的动作被抽象为查找函数，测试可以在不修改进程环境的前提下覆盖任意组合。
//!
//! ## 加载顺序（How）
//! 1. [`NetConfig::default`]；
//! 2. `SOCKNET_CONFIG` 指向的 TOML 文件（整份反序列化，缺省字段取默认值）；
//! 3. 逐项环境变量覆盖；
//! 4. 统一校验：无论取值来自文件还是环境变量，都必须满足同一组约束。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_CONFIG_FILE: &str = "SOCKNET_CONFIG";
pub const ENV_SOCKET_IFNAME: &str = "SOCKNET_SOCKET_IFNAME";
pub const ENV_SOCKET_FAMILY: &str = "SOCKNET_SOCKET_FAMILY";
pub const ENV_LOOPBACK_FALLBACK: &str = "SOCKNET_LOOPBACK_FALLBACK";
pub const ENV_MAX_COMMS: &str = "SOCKNET_MAX_COMMS";
pub const ENV_DEFAULT_SPEED: &str = "SOCKNET_DEFAULT_SPEED";
pub const ENV_NODELAY: &str = "SOCKNET_NODELAY";
pub const ENV_LINGER_SECS: &str = "SOCKNET_LINGER_SECS";
pub const ENV_LISTEN_BACKLOG: &str = "SOCKNET_LISTEN_BACKLOG";

const DEFAULT_MAX_COMMS: i32 = 65536;
const DEFAULT_SPEED_MBPS: i32 = 10000;
const DEFAULT_LISTEN_BACKLOG: i32 = 128;
const DEFAULT_SYSFS_NET_ROOT: &str = "/sys/class/net";

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("failed to parse config document: {0}")]
    Syntax(#[source] Box<toml::de::Error>),
    #[error("invalid value `{value}` for `{key}`: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// 设备发现时允许的地址族。
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    #[serde(alias = "4", alias = "ipv4")]
    Inet,
    #[serde(alias = "6", alias = "ipv6")]
    Inet6,
}

impl AddrFamily {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inet" | "ipv4" | "4" | "af_inet" => Some(AddrFamily::Inet),
            "inet6" | "ipv6" | "6" | "af_inet6" => Some(AddrFamily::Inet6),
            _ => None,
        }
    }
}

/// 传输核心配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `socket_ifname`：接口过滤表达式，逗号分隔的前缀列表；以 `^` 开头表示排除，以 `=` 开头
///     表示精确匹配（语义见 [`crate::device::InterfaceFilter`]）；
///   - `socket_family`：限制只使用某一地址族；
///   - `loopback_fallback`：当没有任何非回环接口可用时是否退化为使用回环接口；
///   - `max_comms`：同时存活的收发通信器上限，同时作为设备属性上报；
///   - `default_speed_mbps`：sysfs 无法给出链路速率时上报的速率；
///   - `nodelay` / `linger_secs`：应用到每条已建立连接的套接字选项；
///   - `listen_backlog`：被动套接字的 backlog；
///   - `sysfs_net_root`：网卡 sysfs 根目录，测试中可指向临时目录。
/// - **风险 (Trade-offs)**：`max_comms` 同时约束本地资源，过小的取值会让宿主在建连阶段失败。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    pub socket_ifname: Option<String>,
    pub socket_family: Option<AddrFamily>,
    pub loopback_fallback: bool,
    pub max_comms: i32,
    pub default_speed_mbps: i32,
    pub nodelay: bool,
    pub linger_secs: Option<u64>,
    pub listen_backlog: i32,
    pub sysfs_net_root: PathBuf,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            socket_ifname: None,
            socket_family: None,
            loopback_fallback: true,
            max_comms: DEFAULT_MAX_COMMS,
            default_speed_mbps: DEFAULT_SPEED_MBPS,
            nodelay: true,
            linger_secs: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            sysfs_net_root: PathBuf::from(DEFAULT_SYSFS_NET_ROOT),
        }
    }
}

impl NetConfig {
    /// 从进程环境加载配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以给定的查找函数代替进程环境加载配置。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取并解析 TOML 配置文件。
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|source| ConfigError::Syntax(Box::new(source)))?;
        config.validate()?;
        Ok(config)
    }

    /// 检查数值项的取值范围。
    ///
    /// `max_comms`、`default_speed_mbps` 与 `listen_backlog` 必须为正数；否则每次建连都会因
    /// 连接上限为零而失败。
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("max_comms", self.max_comms),
            ("default_speed_mbps", self.default_speed_mbps),
            ("listen_backlog", self.listen_backlog),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    expected: "a positive integer",
                });
            }
        }
        Ok(())
    }

    /// `linger_secs` 的 `Duration` 视图。
    pub fn linger(&self) -> Option<Duration> {
        self.linger_secs.map(Duration::from_secs)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup(ENV_SOCKET_IFNAME)) {
            self.socket_ifname = Some(value);
        }
        if let Some(value) = non_empty(lookup(ENV_SOCKET_FAMILY)) {
            self.socket_family =
                Some(
                    AddrFamily::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                        key: ENV_SOCKET_FAMILY,
                        value: value.clone(),
                        expected: "one of inet, inet6, 4, 6",
                    })?,
                );
        }
        if let Some(value) = non_empty(lookup(ENV_LOOPBACK_FALLBACK)) {
            self.loopback_fallback = parse_bool(ENV_LOOPBACK_FALLBACK, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_MAX_COMMS)) {
            self.max_comms = parse_positive(ENV_MAX_COMMS, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_DEFAULT_SPEED)) {
            self.default_speed_mbps = parse_positive(ENV_DEFAULT_SPEED, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_NODELAY)) {
            self.nodelay = parse_bool(ENV_NODELAY, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_LINGER_SECS)) {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_LINGER_SECS,
                    value: value.clone(),
                    expected: "a number of seconds",
                })?;
            self.linger_secs = Some(secs);
        }
        if let Some(value) = non_empty(lookup(ENV_LISTEN_BACKLOG)) {
            self.listen_backlog = parse_positive(ENV_LISTEN_BACKLOG, &value)?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            expected: "a boolean (1/0, true/false)",
        }),
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<i32, ConfigError> {
    match value.trim().parse::<i32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            expected: "a positive integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = NetConfig::from_lookup(|_| None).expect("defaults");
        assert_eq!(config, NetConfig::default());
        assert_eq!(config.max_comms, 65536);
        assert_eq!(config.default_speed_mbps, 10000);
        assert!(config.nodelay);
        assert!(config.loopback_fallback);
        assert_eq!(config.linger(), None);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = NetConfig::from_lookup(lookup_from(&[
            (ENV_SOCKET_IFNAME, "^docker,lo"),
            (ENV_SOCKET_FAMILY, "6"),
            (ENV_MAX_COMMS, "32"),
            (ENV_NODELAY, "0"),
            (ENV_LINGER_SECS, "3"),
            (ENV_LOOPBACK_FALLBACK, "false"),
        ]))
        .expect("overrides");
        assert_eq!(config.socket_ifname.as_deref(), Some("^docker,lo"));
        assert_eq!(config.socket_family, Some(AddrFamily::Inet6));
        assert_eq!(config.max_comms, 32);
        assert!(!config.nodelay);
        assert!(!config.loopback_fallback);
        assert_eq!(config.linger(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let err = NetConfig::from_lookup(lookup_from(&[(ENV_MAX_COMMS, "-1")]))
            .expect_err("negative max comms");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: ENV_MAX_COMMS,
                ..
            }
        ));

        let err = NetConfig::from_lookup(lookup_from(&[(ENV_SOCKET_FAMILY, "ipx")]))
            .expect_err("unknown family");
        assert!(err.to_string().contains("SOCKNET_SOCKET_FAMILY"));
    }

    #[test]
    fn toml_document_fills_missing_fields_with_defaults() {
        let config = NetConfig::from_toml_str(
            r#"
            socket_ifname = "=eth0"
            socket_family = "inet"
            listen_backlog = 16
            "#,
        )
        .expect("parse toml");
        assert_eq!(config.socket_ifname.as_deref(), Some("=eth0"));
        assert_eq!(config.socket_family, Some(AddrFamily::Inet));
        assert_eq!(config.listen_backlog, 16);
        assert_eq!(config.max_comms, 65536);

        assert!(matches!(
            NetConfig::from_toml_str("unknown_key = 1"),
            Err(ConfigError::Syntax(_))
        ));
    }

    #[test]
    fn toml_values_are_range_checked() {
        for (text, field) in [
            ("max_comms = 0", "max_comms"),
            ("max_comms = -4", "max_comms"),
            ("default_speed_mbps = 0", "default_speed_mbps"),
            ("listen_backlog = -1", "listen_backlog"),
        ] {
            let err = NetConfig::from_toml_str(text).expect_err(text);
            assert!(
                matches!(err, ConfigError::InvalidValue { key, .. } if key == field),
                "{text}: {err}"
            );
        }
    }

    #[test]
    fn invalid_config_file_is_rejected_on_load() {
        let dir = std::env::temp_dir().join(format!("socknet-badcfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("socknet.toml");
        std::fs::write(&path, "max_comms = 0\n").expect("write config");

        let path_str = path.to_string_lossy().into_owned();
        let err = NetConfig::from_lookup(lookup_from(&[(ENV_CONFIG_FILE, path_str.as_str())]))
            .expect_err("zero max comms");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "max_comms",
                ..
            }
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_file_is_loaded_before_env_overrides() {
        let dir = std::env::temp_dir().join(format!("socknet-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("socknet.toml");
        std::fs::write(&path, "max_comms = 8\nnodelay = false\n").expect("write config");

        let path_str = path.to_string_lossy().into_owned();
        let config = NetConfig::from_lookup(lookup_from(&[
            (ENV_CONFIG_FILE, path_str.as_str()),
            (ENV_NODELAY, "1"),
        ]))
        .expect("load file");
        assert_eq!(config.max_comms, 8);
        assert!(config.nodelay, "环境变量应覆盖文件中的取值");

        let missing = NetConfig::from_lookup(lookup_from(&[(ENV_CONFIG_FILE, "/nonexistent/x")]))
            .expect_err("missing file");
        assert!(matches!(missing, ConfigError::Read { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
