//! Which upstream a request is rewritten against: one base URL per distro
//! family, plus a runtime-overridable CentOS mirror that administrators can
//! repoint (e.g. to a geographically closer mirror) without restarting.

use std::sync::RwLock;

use url::Url;

/// A package repository family, distinguished by its URL layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distro {
    Debian,
    Ubuntu,
    CentOS,
}

impl Distro {
    /// Guesses the distro family from a request path's leading segment,
    /// matching the path conventions used by `apt`/`yum`/`dnf` clients.
    pub fn from_path(path: &str) -> Option<Self> {
        let first = path.trim_start_matches('/').split('/').next()?;
        match first {
            "debian" | "debian-security" => Some(Self::Debian),
            "ubuntu" => Some(Self::Ubuntu),
            "centos" => Some(Self::CentOS),
            _ => None,
        }
    }
}

/// Known shorthand aliases for common CentOS mirrors, resolved the same
/// way an administrator would type a memorable name instead of a full URL.
fn resolve_centos_alias(value: &str) -> Option<&'static str> {
    match value {
        "cn:tsinghua" => Some("https://mirrors.tuna.tsinghua.edu.cn/centos/"),
        "cn:aliyun" => Some("https://mirrors.aliyun.com/centos/"),
        "cn:ustc" => Some("https://mirrors.ustc.edu.cn/centos/"),
        _ => None,
    }
}

/// The configured base URLs for each distro family, plus the live,
/// runtime-overridable CentOS mirror.
#[derive(Debug)]
pub struct MirrorSet {
    debian: Url,
    ubuntu: Url,
    centos_default: Url,
    centos_override: RwLock<Option<Url>>,
}

impl MirrorSet {
    pub fn new(debian: Url, ubuntu: Url, centos_default: Url) -> Self {
        Self {
            debian,
            ubuntu,
            centos_default,
            centos_override: RwLock::new(None),
        }
    }

    /// The base URL currently in effect for `distro`.
    pub fn base_url(&self, distro: Distro) -> Url {
        match distro {
            Distro::Debian => self.debian.clone(),
            Distro::Ubuntu => self.ubuntu.clone(),
            Distro::CentOS => self
                .centos_override
                .read()
                .expect("centos_override lock poisoned")
                .clone()
                .unwrap_or_else(|| self.centos_default.clone()),
        }
    }

    /// Rewrites `path` against the base URL currently configured for
    /// `distro`, dropping the leading distro-family segment (`/debian/…`,
    /// `/ubuntu/…`, `/centos/…`) that routed the request here in the
    /// first place. Returns `None` if the remainder and the base URL
    /// can't be joined into a valid URL.
    pub fn rewrite(&self, distro: Distro, path: &str) -> Option<Url> {
        let trimmed = path.trim_start_matches('/');
        let remainder = trimmed.split_once('/').map_or("", |(_, rest)| rest);
        self.base_url(distro).join(remainder).ok()
    }

    /// Sets the live CentOS mirror override. Accepts a known shorthand
    /// alias (e.g. `"cn:tsinghua"`), a full URL, or an empty string /
    /// unparseable value, either of which clears the override back to the
    /// configured default.
    pub fn set_centos_mirror(&self, value: &str) {
        let resolved = if value.is_empty() {
            None
        } else if let Some(alias) = resolve_centos_alias(value) {
            Url::parse(alias).ok()
        } else {
            Url::parse(value).ok()
        };
        *self.centos_override.write().expect("centos_override lock poisoned") = resolved;
    }

    /// The active CentOS mirror override, or `None` if using the default.
    pub fn centos_mirror(&self) -> Option<Url> {
        self.centos_override.read().expect("centos_override lock poisoned").clone()
    }

    /// Clears the CentOS mirror override, reverting to the configured default.
    pub fn reset_centos_mirror(&self) {
        *self.centos_override.write().expect("centos_override lock poisoned") = None;
    }
}
