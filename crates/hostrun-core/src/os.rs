//! Operating-system facts discovered on a session

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// `PATH` as discovered on the host plus entries pushed by callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPath {
    /// Entries pushed by callers, latest batch first
    pub pushed: Vec<String>,
    /// Entries reported by `echo $PATH`
    pub system: Vec<String>,
}

impl SystemPath {
    /// Path from a discovered `PATH` value
    #[must_use]
    pub fn discovered(value: &str) -> Self {
        Self {
            pushed: Vec::new(),
            system: value
                .split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Push entries to the front, skipping ones already present
    pub fn push<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch: Vec<String> = Vec::new();
        for path in paths {
            let path = path.as_ref().trim();
            if path.is_empty()
                || path.contains('\n')
                || self.contains(path)
                || batch.iter().any(|p| p == path)
            {
                continue;
            }
            batch.push(path.to_string());
        }
        self.pushed.splice(0..0, batch);
    }

    fn contains(&self, path: &str) -> bool {
        self.pushed.iter().chain(&self.system).any(|p| p == path)
    }

    /// Value suitable for `export PATH=...`
    #[must_use]
    pub fn env_value(&self) -> String {
        let mut entries: Vec<&str> = Vec::with_capacity(self.pushed.len() + self.system.len());
        for entry in self.pushed.iter().chain(&self.system) {
            if !entries.contains(&entry.as_str()) {
                entries.push(entry);
            }
        }
        entries.join(":")
    }
}

/// Facts about the host behind a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystem {
    /// OS family (`linux`, `darwin`)
    pub system: String,
    /// Distribution or product name, lower-cased
    pub name: String,
    /// Version, lower-cased
    pub version: String,
    /// Output of `uname -m`
    pub hardware: String,
    /// `amd64` when any probe mentioned it
    pub architecture: String,
    /// Login user
    pub user: String,
    /// Discovered and pushed `PATH`
    pub path: SystemPath,
}

/// Does `line` name the amd64 architecture
#[must_use]
pub fn is_amd64(line: &str) -> bool {
    line.contains("amd64") || line.contains("x86_64")
}

impl OperatingSystem {
    /// Fill name, version and architecture from `sw_vers` / `lsb_release -a`
    /// output
    pub fn apply_release(&mut self, output: &str) {
        for line in output.lines().map(|l| l.trim_end_matches('\r')) {
            if is_amd64(line) {
                self.architecture = "amd64".to_string();
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if value.contains(':') {
                continue;
            }
            let key: String = key.to_lowercase().chars().filter(|c| *c != ' ').collect();
            let value: String = value
                .trim()
                .chars()
                .filter(|c| *c != ' ')
                .collect::<String>()
                .to_lowercase();
            match key.as_str() {
                "productname" | "distributorid" => self.name = value,
                "productversion" | "release" => self.version = value,
                _ => {}
            }
        }
    }

    /// Record `uname -m` output
    pub fn apply_hardware(&mut self, output: &str) {
        self.hardware = output.trim().to_string();
        if is_amd64(&self.hardware) {
            self.architecture = "amd64".to_string();
        }
    }

    /// Record `echo $PATH` output: the first line that looks like a path list
    pub fn apply_path(&mut self, output: &str) {
        if let Some(line) = output
            .lines()
            .map(str::trim)
            .find(|l| l.contains(':') && l.contains('/'))
        {
            self.path.system = SystemPath::discovered(line).system;
        }
    }

    /// Whether this host satisfies `target`
    #[must_use]
    pub fn matches(&self, target: &OperatingSystemTarget) -> bool {
        if target.name.as_ref().is_some_and(|n| *n != self.name) {
            return false;
        }
        if target.system.as_ref().is_some_and(|s| *s != self.system) {
            return false;
        }
        let below_min = target
            .min_required_version
            .as_ref()
            .is_some_and(|min| compare_versions(&self.version, min) == Ordering::Less);
        let above_max = target
            .max_allowed_version
            .as_ref()
            .is_some_and(|max| compare_versions(&self.version, max) == Ordering::Greater);
        !below_min && !above_max
    }
}

/// Compare dotted versions numerically, missing components count as zero
fn compare_versions(left: &str, right: &str) -> Ordering {
    fn parts(version: &str) -> Vec<u64> {
        version
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }
    let (l, r) = (parts(left), parts(right));
    let len = l.len().max(r.len());
    (0..len)
        .map(|i| {
            l.get(i)
                .copied()
                .unwrap_or(0)
                .cmp(&r.get(i).copied().unwrap_or(0))
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Constraint on the host an operation applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatingSystemTarget {
    /// Required OS family
    pub system: Option<String>,
    /// Required distribution or product name
    pub name: Option<String>,
    /// Lowest accepted version
    pub min_required_version: Option<String>,
    /// Highest accepted version
    pub max_allowed_version: Option<String>,
}

/// Service manager available on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonType {
    /// macOS `launchctl`
    Launchctl,
    /// SysV `service`
    Service,
    /// `systemctl`
    Systemd,
    /// None of the probes succeeded
    Unknown,
}

impl DaemonType {
    /// Probes in the order they are tried
    pub const PROBES: [(DaemonType, &'static str); 3] = [
        (DaemonType::Launchctl, "launchctl version"),
        (DaemonType::Service, "service --version"),
        (DaemonType::Systemd, "systemctl --version"),
    ];
}

impl std::fmt::Display for DaemonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DaemonType::Launchctl => "launchctl",
            DaemonType::Service => "service",
            DaemonType::Systemd => "systemd",
            DaemonType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
