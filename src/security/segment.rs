use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::warn;

/// IpSegment is a set of single addresses, CIDR networks and inclusive ranges
///
/// Specs are written as `10.0.0.1`, `10.0.0.0/8` or `10.0.0.1-10.0.0.9`.
/// Blank lines and `#` comments are ignored.
#[derive(Debug, Default, Clone)]
pub struct IpSegment {
    singles: BTreeSet<IpAddr>,
    networks: Vec<IpNet>,
    ranges: Vec<(IpAddr, IpAddr)>,
}

enum Spec {
    Single(IpAddr),
    Network(IpNet),
    Range(IpAddr, IpAddr),
}

fn parse_spec(spec: &str) -> Option<Spec> {
    let spec = spec.trim();
    if spec.is_empty() || spec.starts_with('#') {
        return None;
    }

    if spec.contains('/') {
        // Host bits are masked off, as a non-strict parse would
        return spec.parse::<IpNet>().ok().map(|n| Spec::Network(n.trunc()));
    }

    if let Some((start, end)) = spec.split_once('-') {
        let start: IpAddr = start.trim().parse().ok()?;
        let end: IpAddr = end.trim().parse().ok()?;
        if start.is_ipv4() != end.is_ipv4() || start > end {
            return None;
        }
        return Some(Spec::Range(start, end));
    }

    spec.parse().ok().map(Spec::Single)
}

/// IpSegment implementation block
impl IpSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// add parses and stores one spec, returning false when it is invalid
    pub fn add(&mut self, spec: &str) -> bool {
        match parse_spec(spec) {
            Some(Spec::Single(ip)) => {
                self.singles.insert(ip);
            }
            Some(Spec::Network(net)) => {
                if !self.networks.contains(&net) {
                    self.networks.push(net);
                }
            }
            Some(Spec::Range(start, end)) => {
                if !self.ranges.contains(&(start, end)) {
                    self.ranges.push((start, end));
                }
            }
            None => {
                if !spec.trim().is_empty() && !spec.trim().starts_with('#') {
                    warn!(spec = %spec, "invalid ip spec");
                }
                return false;
            }
        }
        true
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.singles.contains(&ip)
            || self.networks.iter().any(|n| n.contains(&ip))
            || self
                .ranges
                .iter()
                .any(|(start, end)| *start <= ip && ip <= *end)
    }

    /// remove drops a spec previously added in the same form
    pub fn remove(&mut self, spec: &str) -> bool {
        match parse_spec(spec) {
            Some(Spec::Single(ip)) => self.singles.remove(&ip),
            Some(Spec::Network(net)) => remove_item(&mut self.networks, &net),
            Some(Spec::Range(start, end)) => remove_item(&mut self.ranges, &(start, end)),
            None => false,
        }
    }

    /// entries lists singles (sorted), then networks, then ranges
    pub fn entries(&self) -> Vec<String> {
        self.singles
            .iter()
            .map(|ip| ip.to_string())
            .chain(self.networks.iter().map(|n| n.to_string()))
            .chain(self.ranges.iter().map(|(s, e)| format!("{s}-{e}")))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.singles.len() + self.networks.len() + self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_item<T: PartialEq>(items: &mut Vec<T>, item: &T) -> bool {
    match items.iter().position(|i| i == item) {
        Some(idx) => {
            items.remove(idx);
            true
        }
        None => false,
    }
}
