use super::{Emulator, LaunchRequest};
use crate::{
    config::Controller,
    process_control::{self, Termination},
    topology::{Host, Link, Node, Switch, Topology},
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Linux limits interface names to 15 bytes.
const MAX_IFNAME_LEN: usize = 15;

/// Executes the shell-style command lines the netns backend produces.
pub trait CommandRunner: Send {
    fn run(&mut self, command: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, command: &str) -> anyhow::Result<()> {
        debug!("{}", command);
        let output = process_control::run_command(&[], command)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "`{}` failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// Realises a topology with Open vSwitch bridges for switches, one network namespace per host
/// and `tc netem` shaped veth pairs for links.
#[derive(Debug)]
pub struct NetnsEmulator<R: CommandRunner = SystemRunner> {
    runner: R,
    static_arp: bool,
    switches: Vec<String>,
    hosts: Vec<String>,
    root_interfaces: Vec<String>,
}

impl NetnsEmulator<SystemRunner> {
    pub fn new(static_arp: bool) -> Self {
        NetnsEmulator::with_runner(SystemRunner, static_arp)
    }
}

impl<R: CommandRunner> NetnsEmulator<R> {
    pub fn with_runner(runner: R, static_arp: bool) -> Self {
        NetnsEmulator {
            runner,
            static_arp,
            switches: vec![],
            hosts: vec![],
            root_interfaces: vec![],
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn add_switch(&mut self, switch: &Switch) -> anyhow::Result<()> {
        check_ifname(&switch.name)?;
        self.switches.push(switch.name.clone());
        self.runner.run(&format!(
            "ovs-vsctl --may-exist add-br {0} -- set bridge {0} other-config:datapath-id={1} fail-mode=secure",
            switch.name, switch.dpid
        ))
    }

    fn add_host(&mut self, host: &Host) -> anyhow::Result<()> {
        self.runner.run(&format!("ip netns add {}", host.name))?;
        self.hosts.push(host.name.clone());
        self.runner.run(&in_host(&host.name, "ip link set lo up"))
    }

    fn attach_to_switch(&mut self, switch: &Switch, iface: &str, link: &Link) -> anyhow::Result<()> {
        self.runner
            .run(&format!("ovs-vsctl add-port {} {}", switch.name, iface))?;
        self.runner.run(&format!("ip link set {} up", iface))?;
        self.runner.run(&shape(iface, link))
    }

    fn attach_to_host(
        &mut self,
        host: &Host,
        iface: &str,
        mac: Option<&str>,
        link: &Link,
    ) -> anyhow::Result<()> {
        self.runner
            .run(&format!("ip link set {} netns {}", iface, host.name))?;
        if let Some(mac) = mac {
            self.runner.run(&in_host(
                &host.name,
                &format!("ip link set dev {} address {}", iface, mac),
            ))?;
            self.runner.run(&in_host(
                &host.name,
                &format!("ip addr add {} dev {}", host.ip, iface),
            ))?;
        }
        self.runner
            .run(&in_host(&host.name, &format!("ip link set {} up", iface)))?;
        self.runner.run(&in_host(&host.name, &shape(iface, link)))
    }

    fn add_link(
        &mut self,
        topology: &Topology,
        link: &Link,
        ports: &mut HashMap<String, usize>,
        host_ifaces: &mut HashMap<String, (String, String)>,
    ) -> anyhow::Result<()> {
        let a_if = next_interface(ports, &link.a)?;
        let b_if = next_interface(ports, &link.b)?;

        self.runner
            .run(&format!("ip link add {} type veth peer name {}", a_if, b_if))?;

        // deleting the switch side also removes the peer, wherever it lives
        if let Some(root_if) = [(&link.a, &a_if), (&link.b, &b_if)]
            .into_iter()
            .find(|(node, _)| matches!(topology.node(node), Some(Node::Switch(_))))
            .map(|(_, iface)| iface.clone())
        {
            self.root_interfaces.push(root_if);
        }

        for (node, iface) in [(&link.a, &a_if), (&link.b, &b_if)] {
            match topology.node(node) {
                Some(Node::Switch(switch)) => self.attach_to_switch(switch, iface, link)?,
                Some(Node::Host(host)) => {
                    let first = !host_ifaces.contains_key(&host.name);
                    let mac = if first {
                        let idx = topology
                            .hosts()
                            .iter()
                            .position(|h| h.name == host.name)
                            .unwrap_or_default();
                        let mac = host_mac(idx);
                        host_ifaces.insert(host.name.clone(), (iface.clone(), mac.clone()));
                        Some(mac)
                    } else {
                        None
                    };
                    self.attach_to_host(host, iface, mac.as_deref(), link)?;
                }
                None => bail!("Link endpoint `{}` is not part of the topology", node),
            }
        }

        Ok(())
    }

    /// Every host learns the MAC of every other host up front so no ARP traffic reaches the
    /// controller.
    fn static_arp(
        &mut self,
        topology: &Topology,
        host_ifaces: &HashMap<String, (String, String)>,
    ) -> anyhow::Result<()> {
        for host in topology.hosts() {
            let Some((iface, _)) = host_ifaces.get(&host.name) else {
                continue;
            };
            for other in topology.hosts().iter().filter(|o| o.name != host.name) {
                let Some((_, mac)) = host_ifaces.get(&other.name) else {
                    continue;
                };
                self.runner.run(&in_host(
                    &host.name,
                    &format!(
                        "ip neigh replace {} lladdr {} dev {} nud permanent",
                        other.ip.addr(),
                        mac,
                        iface
                    ),
                ))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> Emulator for NetnsEmulator<R> {
    fn build(&mut self, topology: &Topology) -> anyhow::Result<()> {
        for switch in topology.switches() {
            self.add_switch(switch)?;
        }
        for host in topology.hosts() {
            self.add_host(host)?;
        }

        let mut ports = HashMap::new();
        let mut host_ifaces = HashMap::new();
        for link in topology.links() {
            self.add_link(topology, link, &mut ports, &mut host_ifaces)?;
        }

        if self.static_arp {
            self.static_arp(topology, &host_ifaces)?;
        }

        Ok(())
    }

    fn start_switch(&mut self, switch: &Switch, controller: &Controller) -> anyhow::Result<()> {
        self.runner.run(&format!(
            "ovs-vsctl set-controller {} {}",
            switch.name,
            controller.target()
        ))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let mut failures = vec![];

        for iface in std::mem::take(&mut self.root_interfaces) {
            if let Err(err) = self.runner.run(&format!("ip link delete {}", iface)) {
                warn!("{}", err);
                failures.push(err.to_string());
            }
        }
        for switch in std::mem::take(&mut self.switches) {
            if let Err(err) = self
                .runner
                .run(&format!("ovs-vsctl --if-exists del-br {}", switch))
            {
                warn!("{}", err);
                failures.push(err.to_string());
            }
        }
        for host in std::mem::take(&mut self.hosts) {
            if let Err(err) = self.runner.run(&format!("ip netns delete {}", host)) {
                warn!("{}", err);
                failures.push(err.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "Network teardown incomplete:\n{}",
                failures.join("\n")
            ))
        }
    }

    fn spawn(&mut self, request: &LaunchRequest) -> anyhow::Result<u32> {
        let prefix = match request.host {
            Some(host) => vec!["ip", "netns", "exec", host],
            None => vec![],
        };
        process_control::run_command_detached(
            &prefix,
            request.command,
            request.redirect,
            request.name,
            request.cwd,
        )
    }

    async fn exec(&mut self, host: &str, command: &str) -> anyhow::Result<bool> {
        let output =
            process_control::run_command_async(&["ip", "netns", "exec", host], command).await?;
        Ok(output.status.success())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        process_control::is_alive(pid)
    }

    fn terminate(&mut self, pid: u32) -> anyhow::Result<Termination> {
        process_control::terminate(pid)
    }
}

fn in_host(host: &str, command: &str) -> String {
    format!("ip netns exec {} {}", host, command)
}

fn shape(iface: &str, link: &Link) -> String {
    match &link.delay {
        Some(delay) => format!(
            "tc qdisc replace dev {} root netem rate {}mbit delay {}",
            iface, link.bw, delay
        ),
        None => format!("tc qdisc replace dev {} root netem rate {}mbit", iface, link.bw),
    }
}

fn check_ifname(name: &str) -> anyhow::Result<()> {
    if name.len() > MAX_IFNAME_LEN {
        bail!(
            "Interface name `{}` is longer than {} characters",
            name,
            MAX_IFNAME_LEN
        );
    }
    Ok(())
}

fn next_interface(ports: &mut HashMap<String, usize>, node: &str) -> anyhow::Result<String> {
    let port = ports.entry(node.to_string()).or_default();
    let iface = format!("{}-eth{}", node, port);
    *port += 1;
    check_ifname(&iface)?;
    Ok(iface)
}

fn host_mac(idx: usize) -> String {
    let n = idx + 1;
    format!("00:00:00:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff)
}
