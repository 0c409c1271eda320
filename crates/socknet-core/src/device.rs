//! # device 模块说明
//!
//! ## 意图（Why）
//! - 宿主在初始化时一次性枚举网络设备，之后全程以下标引用；本模块负责把操作系统的网卡列表
//!   转换为有序、不可变的 [`SocketDevice`] 列表，并投影出宿主关心的 [`NetProperties`]；
//! - 发现过程拆成“采集候选 → 纯函数筛选 → 读取 sysfs 属性”三步，筛选逻辑不依赖真实网卡，
//!   可以在单元测试中完整覆盖。
//!
//! ## 规则（What）
//! - 只保留处于 UP 状态、带 IPv4/IPv6 地址、名称短于 `IFNAMSIZ` 的接口，按接口名去重；
//! - 同一接口优先使用 IPv4 地址；
//! - 回环接口默认跳过，仅在没有其它可用接口且允许回退时使用；
//! - 接口过滤表达式语义见 [`InterfaceFilter`]。

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::{debug, warn};

use crate::config::{AddrFamily, NetConfig};

/// 设备可直接收发的内存类型：主机内存。
pub const PTR_HOST: i32 = 0x1;
/// 设备可直接收发的内存类型：GPU 显存（本引擎不支持）。
pub const PTR_CUDA: i32 = 0x2;

const MAX_IF_NAME_SIZE: usize = 16;

/// 设备属性投影，字段与宿主 ABI 的属性结构一一对应。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetProperties {
    pub name: String,
    pub pci_path: String,
    pub guid: u64,
    pub ptr_support: i32,
    /// 链路速率，单位 Mbps。
    pub speed: i32,
    pub port: i32,
    pub max_comms: i32,
}

/// 一个可用的网络设备。
///
/// # 教案式说明
/// - **契约 (What)**：在引擎生命周期内不可变；`addr` 的端口恒为 0，`listen` 时绑定到该地址并由
///   内核分配临时端口；
/// - **来源 (How)**：由 [`discover`] 根据 [`NetConfig`] 生成，测试可直接用 [`SocketDevice::new`]
///   构造后注入引擎。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SocketDevice {
    name: String,
    addr: SocketAddr,
    pci_path: String,
    guid: u64,
    speed: i32,
    max_comms: i32,
}

impl SocketDevice {
    /// 以显式字段构造设备；`guid` 为 0 时会被替换为由名称派生的非零值。
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        pci_path: impl Into<String>,
        guid: u64,
        speed: i32,
        max_comms: i32,
    ) -> Self {
        let name = name.into();
        let guid = if guid == 0 { name_guid(&name) } else { guid };
        Self {
            name,
            addr: with_port_zero(addr),
            pci_path: pci_path.into(),
            guid,
            speed,
            max_comms,
        }
    }

    /// 读取 sysfs 补全设备属性。
    pub fn probe(name: &str, addr: SocketAddr, config: &NetConfig) -> Self {
        let root = config.sysfs_net_root.as_path();
        Self::new(
            name,
            addr,
            pci_path(root, name),
            mac_guid(root, name).unwrap_or(0),
            link_speed(root, name, config.default_speed_mbps),
            config.max_comms,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 绑定监听套接字使用的地址（端口为 0）。
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 投影为宿主属性结构。
    pub fn properties(&self) -> NetProperties {
        NetProperties {
            name: self.name.clone(),
            pci_path: self.pci_path.clone(),
            guid: self.guid,
            ptr_support: PTR_HOST,
            speed: self.speed,
            port: 0,
            max_comms: self.max_comms,
        }
    }
}

fn with_port_zero(mut addr: SocketAddr) -> SocketAddr {
    addr.set_port(0);
    addr
}

/// 接口过滤表达式。
///
/// - 逗号分隔的前缀列表，例如 `eth,ib`；
/// - 以 `^` 开头表示排除列表，例如 `^docker,lo`；
/// - 紧随其后的 `=` 表示精确匹配，例如 `=eth0` 或 `^=eth1`；
/// - 空表达式匹配一切。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InterfaceFilter {
    exclude: bool,
    exact: bool,
    patterns: Vec<String>,
}

impl InterfaceFilter {
    pub fn parse(expr: &str) -> Self {
        let mut rest = expr.trim();
        let exclude = rest.starts_with('^');
        if exclude {
            rest = &rest[1..];
        }
        let exact = rest.starts_with('=');
        if exact {
            rest = &rest[1..];
        }
        let patterns = rest
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            exclude,
            exact,
            patterns,
        }
    }

    /// 过滤器是否包含显式条件。
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let hit = self.patterns.iter().any(|pattern| {
            if self.exact {
                name == pattern
            } else {
                name.starts_with(pattern.as_str())
            }
        });
        hit != self.exclude
    }
}

/// 操作系统报告的一个接口地址。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceCandidate {
    pub name: String,
    pub addr: SocketAddr,
    pub up: bool,
    pub loopback: bool,
}

/// 枚举本机网卡并生成设备列表。
pub fn discover(config: &NetConfig) -> Vec<SocketDevice> {
    let candidates = match system_candidates() {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(error = %err, "getifaddrs failed; no socket devices available");
            return Vec::new();
        }
    };
    let devices: Vec<SocketDevice> = select_interfaces(&candidates, config)
        .into_iter()
        .map(|candidate| SocketDevice::probe(&candidate.name, candidate.addr, config))
        .collect();
    for (index, device) in devices.iter().enumerate() {
        debug!(
            dev = index,
            name = device.name(),
            addr = %device.addr(),
            guid = device.guid,
            speed = device.speed,
            "socket device discovered"
        );
    }
    devices
}

fn system_candidates() -> nix::Result<Vec<InterfaceCandidate>> {
    let mut out = Vec::new();
    for ifaddr in getifaddrs()? {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let addr = if let Some(sin) = storage.as_sockaddr_in() {
            SocketAddr::V4(SocketAddrV4::from(*sin))
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            SocketAddr::V6(SocketAddrV6::from(*sin6))
        } else {
            continue;
        };
        out.push(InterfaceCandidate {
            name: ifaddr.interface_name,
            addr,
            up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
            loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
        });
    }
    Ok(out)
}

/// 纯函数形式的接口筛选：按首次出现的顺序为每个接口选出一个地址。
pub fn select_interfaces(
    candidates: &[InterfaceCandidate],
    config: &NetConfig,
) -> Vec<InterfaceCandidate> {
    let filter = config
        .socket_ifname
        .as_deref()
        .map(InterfaceFilter::parse)
        .unwrap_or_default();

    let eligible = |candidate: &&InterfaceCandidate| {
        candidate.up
            && candidate.name.len() < MAX_IF_NAME_SIZE
            && family_allowed(candidate.addr, config.socket_family)
            && filter.matches(&candidate.name)
    };

    let primary = pick_per_interface(candidates.iter().filter(eligible).filter(|c| !c.loopback));
    if !primary.is_empty() || !config.loopback_fallback {
        return primary;
    }
    pick_per_interface(candidates.iter().filter(eligible).filter(|c| c.loopback))
}

fn family_allowed(addr: SocketAddr, family: Option<AddrFamily>) -> bool {
    match family {
        None => true,
        Some(AddrFamily::Inet) => addr.is_ipv4(),
        Some(AddrFamily::Inet6) => addr.is_ipv6(),
    }
}

fn pick_per_interface<'a>(
    candidates: impl Iterator<Item = &'a InterfaceCandidate>,
) -> Vec<InterfaceCandidate> {
    let mut picked: Vec<InterfaceCandidate> = Vec::new();
    for candidate in candidates {
        match picked.iter_mut().find(|p| p.name == candidate.name) {
            Some(existing) => {
                if existing.addr.is_ipv6() && candidate.addr.is_ipv4() {
                    existing.addr = candidate.addr;
                }
            }
            None => picked.push(candidate.clone()),
        }
    }
    picked
}

/// 读取 `<root>/<if>/speed`；缺失、无法解析或非正值时返回 `default`。
pub fn link_speed(root: &Path, name: &str, default: i32) -> i32 {
    let path = root.join(name).join("speed");
    match std::fs::read_to_string(&path) {
        Ok(text) => match text.trim().parse::<i32>() {
            Ok(speed) if speed > 0 => speed,
            _ => {
                debug!(path = %path.display(), default, "unusable link speed; using default");
                default
            }
        },
        Err(_) => {
            debug!(path = %path.display(), default, "could not read link speed; using default");
            default
        }
    }
}

/// 设备的 PCI 局部性路径：规范化后的 `<root>/<if>/device`，失败时退回未规范化的路径。
pub fn pci_path(root: &Path, name: &str) -> String {
    let path = root.join(name).join("device");
    std::fs::canonicalize(&path)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// 由 `<root>/<if>/address` 中的 MAC 地址派生 GUID；全零 MAC 视为不可用。
pub fn mac_guid(root: &Path, name: &str) -> Option<u64> {
    let text = std::fs::read_to_string(root.join(name).join("address")).ok()?;
    let mut guid = 0u64;
    let mut octets = 0;
    for part in text.trim().split(':') {
        let byte = u8::from_str_radix(part, 16).ok()?;
        guid = (guid << 8) | u64::from(byte);
        octets += 1;
    }
    (octets == 6 && guid != 0).then_some(guid)
}

fn name_guid(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn candidate(name: &str, addr: &str, loopback: bool) -> InterfaceCandidate {
        InterfaceCandidate {
            name: name.to_owned(),
            addr: addr.parse().expect("addr"),
            up: true,
            loopback,
        }
    }

    fn sample() -> Vec<InterfaceCandidate> {
        vec![
            candidate("lo", "127.0.0.1:0", true),
            candidate("eth0", "[fe80::1]:0", false),
            candidate("eth0", "10.0.0.5:0", false),
            candidate("ib0", "192.168.7.1:0", false),
            candidate("docker0", "172.17.0.1:0", false),
        ]
    }

    fn names(selected: &[InterfaceCandidate]) -> Vec<&str> {
        selected.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn filter_supports_prefix_exclude_and_exact() {
        let prefix = InterfaceFilter::parse("eth,ib");
        assert!(prefix.matches("eth12"));
        assert!(prefix.matches("ib0"));
        assert!(!prefix.matches("docker0"));

        let exclude = InterfaceFilter::parse("^docker,lo");
        assert!(!exclude.matches("docker0"));
        assert!(exclude.matches("eth0"));

        let exact = InterfaceFilter::parse("=eth0");
        assert!(exact.matches("eth0"));
        assert!(!exact.matches("eth01"));

        let exclude_exact = InterfaceFilter::parse("^=eth0");
        assert!(!exclude_exact.matches("eth0"));
        assert!(exclude_exact.matches("eth01"));

        assert!(InterfaceFilter::parse("  ").matches("anything"));
    }

    #[test]
    fn selection_dedups_and_prefers_ipv4() {
        let selected = select_interfaces(&sample(), &NetConfig::default());
        assert_eq!(names(&selected), vec!["eth0", "ib0", "docker0"]);
        assert_eq!(selected[0].addr, "10.0.0.5:0".parse::<SocketAddr>().expect("addr"));
    }

    #[test]
    fn selection_honours_filter_and_family() {
        let config = NetConfig {
            socket_ifname: Some("^docker".into()),
            socket_family: Some(AddrFamily::Inet6),
            ..NetConfig::default()
        };
        let selected = select_interfaces(&sample(), &config);
        assert_eq!(names(&selected), vec!["eth0"]);
        assert!(selected[0].addr.is_ipv6());
    }

    #[test]
    fn loopback_is_a_fallback_only() {
        let only_lo = vec![candidate("lo", "127.0.0.1:0", true)];
        let selected = select_interfaces(&only_lo, &NetConfig::default());
        assert_eq!(names(&selected), vec!["lo"]);

        let strict = NetConfig {
            loopback_fallback: false,
            ..NetConfig::default()
        };
        assert!(select_interfaces(&only_lo, &strict).is_empty());
    }

    #[test]
    fn down_and_long_named_interfaces_are_skipped() {
        let mut down = candidate("eth0", "10.0.0.1:0", false);
        down.up = false;
        let long = candidate("averyveryverylongname0", "10.0.0.2:0", false);
        let selected = select_interfaces(&[down, long], &NetConfig::default());
        assert!(selected.is_empty());
    }

    fn fake_sysfs(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("socknet-sysfs-{tag}-{}", std::process::id()));
        let eth = root.join("eth9");
        std::fs::create_dir_all(&eth).expect("create fake sysfs");
        root
    }

    #[test]
    fn sysfs_attributes_are_parsed_with_fallbacks() {
        let root = fake_sysfs("attrs");
        let eth = root.join("eth9");
        std::fs::write(eth.join("speed"), "25000\n").expect("speed");
        std::fs::write(eth.join("address"), "0a:1b:2c:3d:4e:5f\n").expect("mac");

        assert_eq!(link_speed(&root, "eth9", 10000), 25000);
        assert_eq!(mac_guid(&root, "eth9"), Some(0x0a1b_2c3d_4e5f));
        assert_eq!(link_speed(&root, "missing", 10000), 10000);
        assert_eq!(mac_guid(&root, "missing"), None);
        assert!(pci_path(&root, "eth9").ends_with("eth9/device"));

        std::fs::write(eth.join("speed"), "-1\n").expect("speed");
        std::fs::write(eth.join("address"), "00:00:00:00:00:00\n").expect("mac");
        assert_eq!(link_speed(&root, "eth9", 10000), 10000);
        assert_eq!(mac_guid(&root, "eth9"), None);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probed_device_has_nonzero_guid_and_host_pointer_support() {
        let root = fake_sysfs("probe");
        let config = NetConfig {
            sysfs_net_root: root.clone(),
            max_comms: 7,
            ..NetConfig::default()
        };
        let device = SocketDevice::probe("eth9", "10.0.0.9:1234".parse().expect("addr"), &config);
        let props = device.properties();
        assert_eq!(props.name, "eth9");
        assert_ne!(props.guid, 0);
        assert_eq!(props.ptr_support, PTR_HOST);
        assert_eq!(props.speed, 10000);
        assert_eq!(props.port, 0);
        assert_eq!(props.max_comms, 7);
        assert_eq!(device.addr().port(), 0);
        assert_eq!(props, device.properties());

        let _ = std::fs::remove_dir_all(&root);
    }
}
