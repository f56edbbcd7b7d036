use super::{Emulator, LaunchRequest};
use crate::{
    config::Controller,
    process_control::Termination,
    topology::{Switch, Topology},
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::info;

const FIRST_PID: u32 = 10_000;

/// Logs what would happen without touching the system. Spawned processes get synthetic pids
/// and stay "alive" until terminated.
#[derive(Debug)]
pub struct DryRunEmulator {
    next_pid: u32,
    running: BTreeSet<u32>,
}

impl Default for DryRunEmulator {
    fn default() -> Self {
        DryRunEmulator {
            next_pid: FIRST_PID,
            running: BTreeSet::new(),
        }
    }
}

impl DryRunEmulator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Emulator for DryRunEmulator {
    fn build(&mut self, topology: &Topology) -> anyhow::Result<()> {
        info!(
            "[dry-run] build {} switches, {} hosts, {} links",
            topology.switches().len(),
            topology.hosts().len(),
            topology.links().len()
        );
        Ok(())
    }

    fn start_switch(&mut self, switch: &Switch, controller: &Controller) -> anyhow::Result<()> {
        info!(
            "[dry-run] start switch {} ({}) -> {}",
            switch.name,
            switch.dpid,
            controller.target()
        );
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        info!("[dry-run] stop network");
        Ok(())
    }

    fn spawn(&mut self, request: &LaunchRequest) -> anyhow::Result<u32> {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.running.insert(pid);
        info!(
            "[dry-run] {} $ {} (pid {})",
            request.host.unwrap_or("local"),
            request.command,
            pid
        );
        Ok(pid)
    }

    async fn exec(&mut self, host: &str, command: &str) -> anyhow::Result<bool> {
        info!("[dry-run] {} $ {}", host, command);
        Ok(true)
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.running.contains(&pid)
    }

    fn terminate(&mut self, pid: u32) -> anyhow::Result<Termination> {
        if self.running.remove(&pid) {
            Ok(Termination::Signalled)
        } else {
            Ok(Termination::AlreadyGone)
        }
    }
}
