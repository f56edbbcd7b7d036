use crate::config::Config;
use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

/// OpenFlow datapath id. Written either as an integer or as colon separated hex octets
/// (`00:00:00:00:00:00:00:10` is 0x10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "DpidRepr", into = "String")]
pub struct Dpid(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum DpidRepr {
    Int(u64),
    Str(String),
}

impl TryFrom<DpidRepr> for Dpid {
    type Error = anyhow::Error;

    fn try_from(repr: DpidRepr) -> Result<Self, Self::Error> {
        match repr {
            DpidRepr::Int(id) => Ok(Dpid(id)),
            DpidRepr::Str(s) => s.parse(),
        }
    }
}

impl FromStr for Dpid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.replace(':', "");
        if hex.is_empty() || hex.len() > 16 {
            bail!("Invalid datapath id `{}`", s);
        }
        u64::from_str_radix(&hex, 16)
            .map(Dpid)
            .context(format!("Invalid datapath id `{}`", s))
    }
}

impl From<Dpid> for String {
    fn from(dpid: Dpid) -> Self {
        dpid.to_string()
    }
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    pub name: String,
    pub dpid: Dpid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub ip: Ipv4Net,
}

/// A bidirectional link shaped to `bw` Mbit/s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub a: String,
    pub b: String,
    pub bw: u32,
    pub delay: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node<'a> {
    Switch(&'a Switch),
    Host(&'a Host),
}
impl<'a> Node<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Node::Switch(sw) => &sw.name,
            Node::Host(host) => &host.name,
        }
    }
}

/// Static description of the emulated network. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    switches: Vec<Switch>,
    hosts: Vec<Host>,
    links: Vec<Link>,
}
impl Topology {
    pub fn from_config(config: &Config) -> anyhow::Result<Topology> {
        let mut builder = TopologyBuilder::new();
        for sw in config.switches.iter() {
            builder = builder.switch(&sw.name, sw.dpid);
        }
        for host in config.hosts.iter() {
            builder = builder.host(&host.name, config.host_address(&host.name)?);
        }
        for link in config.links.iter() {
            builder = builder.link_with_delay(&link.a, &link.b, link.bw, link.delay.clone());
        }

        builder.build()
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Switches first, then hosts, both in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = Node<'_>> {
        self.switches
            .iter()
            .map(Node::Switch)
            .chain(self.hosts.iter().map(Node::Host))
    }

    pub fn node(&self, name: &str) -> Option<Node<'_>> {
        self.nodes().find(|node| node.name() == name)
    }

    pub fn find_host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.name == name)
    }

    pub fn node_count(&self) -> usize {
        self.switches.len() + self.hosts.len()
    }

    pub fn edge_count(&self) -> usize {
        self.links.len()
    }
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    switches: Vec<Switch>,
    hosts: Vec<Host>,
    links: Vec<Link>,
}
impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switch(mut self, name: &str, dpid: Dpid) -> Self {
        self.switches.push(Switch {
            name: name.to_string(),
            dpid,
        });
        self
    }

    pub fn host(mut self, name: &str, ip: Ipv4Net) -> Self {
        self.hosts.push(Host {
            name: name.to_string(),
            ip,
        });
        self
    }

    pub fn link(self, a: &str, b: &str, bw: u32) -> Self {
        self.link_with_delay(a, b, bw, None)
    }

    pub fn link_with_delay(mut self, a: &str, b: &str, bw: u32, delay: Option<String>) -> Self {
        self.links.push(Link {
            a: a.to_string(),
            b: b.to_string(),
            bw,
            delay,
        });
        self
    }

    /// Checks the collected nodes and links and produces the topology.
    ///
    /// # Returns
    ///
    /// An error for duplicate node names, datapath ids or addresses, for links that reference
    /// unknown nodes, loop back to the same node, repeat an existing link or have no bandwidth.
    pub fn build(self) -> anyhow::Result<Topology> {
        let mut names = HashSet::new();
        for name in self
            .switches
            .iter()
            .map(|sw| &sw.name)
            .chain(self.hosts.iter().map(|h| &h.name))
        {
            if name.is_empty() {
                bail!("Node names must not be empty");
            }
            if !names.insert(name.as_str()) {
                bail!("Duplicate node name `{}`", name);
            }
        }

        let mut dpids = HashMap::new();
        for sw in self.switches.iter() {
            if let Some(other) = dpids.insert(sw.dpid, &sw.name) {
                bail!(
                    "Switches `{}` and `{}` share datapath id {}",
                    other,
                    sw.name,
                    sw.dpid
                );
            }
        }

        let mut addrs = HashMap::new();
        for host in self.hosts.iter() {
            if let Some(other) = addrs.insert(host.ip.addr(), &host.name) {
                bail!(
                    "Hosts `{}` and `{}` share address {}",
                    other,
                    host.name,
                    host.ip.addr()
                );
            }
        }

        let mut pairs = HashSet::new();
        for link in self.links.iter() {
            for end in [&link.a, &link.b] {
                if !names.contains(end.as_str()) {
                    bail!("Link {} <-> {} references unknown node `{}`", link.a, link.b, end);
                }
            }
            if link.a == link.b {
                bail!("Link from `{}` to itself", link.a);
            }
            if link.bw == 0 {
                bail!("Link {} <-> {} has no bandwidth", link.a, link.b);
            }

            let pair = if link.a < link.b {
                (&link.a, &link.b)
            } else {
                (&link.b, &link.a)
            };
            if !pairs.insert(pair) {
                bail!("Duplicate link {} <-> {}", link.a, link.b);
            }
        }

        Ok(Topology {
            switches: self.switches,
            hosts: self.hosts,
            links: self.links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn ip(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn dpid_parses_colon_hex_and_integers() -> anyhow::Result<()> {
        assert_eq!("00:00:00:00:00:00:00:10".parse::<Dpid>()?, Dpid(16));
        assert_eq!("1".parse::<Dpid>()?, Dpid(1));
        assert!("00:00:00:00:00:00:00:00:01".parse::<Dpid>().is_err());
        assert!("zz".parse::<Dpid>().is_err());
        assert_eq!(Dpid(16).to_string(), "0000000000000010");
        Ok(())
    }

    #[test]
    fn example_scenario_has_expected_shape() -> anyhow::Result<()> {
        let config = Config::example()?;
        let topo = Topology::from_config(&config)?;

        assert_eq!(topo.switches().len(), 12);
        assert_eq!(topo.hosts().len(), 12);
        assert_eq!(topo.node_count(), 24);
        assert_eq!(topo.edge_count(), 30);
        assert!(topo.links().iter().all(|link| link.bw == 10));

        let host_links = topo
            .links()
            .iter()
            .filter(|link| topo.find_host(&link.a).is_some() || topo.find_host(&link.b).is_some())
            .count();
        assert_eq!(host_links, 12);

        let names = topo.nodes().map(|n| n.name()).unique().count();
        assert_eq!(names, 24);

        Ok(())
    }

    #[test]
    fn building_twice_gives_identical_topologies() -> anyhow::Result<()> {
        let config = Config::example()?;
        assert_eq!(Topology::from_config(&config)?, Topology::from_config(&config)?);
        Ok(())
    }

    #[test]
    fn rejects_duplicate_names() {
        let res = TopologyBuilder::new()
            .switch("s1", Dpid(1))
            .host("s1", ip("10.0.0.1/24"))
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn rejects_duplicate_dpids() {
        let res = TopologyBuilder::new()
            .switch("s1", Dpid(1))
            .switch("s2", Dpid(1))
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let res = TopologyBuilder::new()
            .host("h1", ip("10.0.0.1/24"))
            .host("h2", ip("10.0.0.1/24"))
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn rejects_bad_links() {
        let base = || {
            TopologyBuilder::new()
                .switch("s1", Dpid(1))
                .switch("s2", Dpid(2))
        };

        assert!(base().link("s1", "nowhere", 10).build().is_err());
        assert!(base().link("s1", "s1", 10).build().is_err());
        assert!(base().link("s1", "s2", 0).build().is_err());
        assert!(base()
            .link("s1", "s2", 10)
            .link("s2", "s1", 10)
            .build()
            .is_err());
        assert!(base().link("s1", "s2", 10).build().is_ok());
    }

    #[test]
    fn node_lookup_distinguishes_switches_and_hosts() -> anyhow::Result<()> {
        let topo = TopologyBuilder::new()
            .switch("s1", Dpid(1))
            .host("h1", ip("10.0.0.1/24"))
            .link("s1", "h1", 5)
            .build()?;

        assert!(matches!(topo.node("s1"), Some(Node::Switch(_))));
        assert!(matches!(topo.node("h1"), Some(Node::Host(_))));
        assert!(topo.node("h2").is_none());
        Ok(())
    }
}
