pub mod dry_run;
pub mod netns;

use crate::{
    config::{Controller, Redirect},
    process_control::Termination,
    topology::{Switch, Topology},
};
use async_trait::async_trait;
use std::path::Path;

/// Everything needed to start one process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    /// Emulated host to run on, `None` for the machine running labrun.
    pub host: Option<&'a str>,
    pub name: &'a str,
    pub command: &'a str,
    pub redirect: Redirect,
    pub cwd: &'a Path,
}

/// The network emulation framework as seen by labrun. Implementations realise a topology,
/// attach its switches to a controller and run commands inside emulated hosts.
#[async_trait]
pub trait Emulator: Send {
    /// Instantiates every node and link of the topology.
    fn build(&mut self, topology: &Topology) -> anyhow::Result<()>;

    /// Attaches a switch's forwarding plane to the controller.
    fn start_switch(&mut self, switch: &Switch, controller: &Controller) -> anyhow::Result<()>;

    /// Removes everything `build` created. Must tolerate a partially built network.
    fn stop(&mut self) -> anyhow::Result<()>;

    /// Starts a background process and returns its pid.
    fn spawn(&mut self, request: &LaunchRequest) -> anyhow::Result<u32>;

    /// Runs a command to completion on a host and reports whether it succeeded. Dropping the
    /// future must stop the command.
    async fn exec(&mut self, host: &str, command: &str) -> anyhow::Result<bool>;

    fn is_alive(&mut self, pid: u32) -> bool;

    fn terminate(&mut self, pid: u32) -> anyhow::Result<Termination>;
}
