use crate::{
    config::Controller,
    emulator::Emulator,
    topology::{Switch, Topology},
};
use anyhow::{bail, Context};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unbuilt,
    Built,
    Started,
    Stopped,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkState::Unbuilt => "unbuilt",
            NetworkState::Built => "built",
            NetworkState::Started => "started",
            NetworkState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Drives the emulated network through `Unbuilt -> Built -> Started -> Stopped`. Every
/// transition is taken at most once and only from its predecessor.
#[derive(Debug)]
pub struct NetworkLifecycle<E: Emulator> {
    emulator: E,
    state: NetworkState,
    touched: bool,
}

impl<E: Emulator> NetworkLifecycle<E> {
    pub fn new(emulator: E) -> Self {
        NetworkLifecycle {
            emulator,
            state: NetworkState::Unbuilt,
            touched: false,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    pub fn emulator_mut(&mut self) -> &mut E {
        &mut self.emulator
    }

    pub fn build(&mut self, topology: &Topology) -> anyhow::Result<()> {
        self.expect_state(NetworkState::Unbuilt, "build")?;

        self.touched = true;
        self.emulator
            .build(topology)
            .context("Failed to build the emulated network")?;

        self.state = NetworkState::Built;
        debug!("network {}", self.state);
        Ok(())
    }

    /// Attaches every switch to the controller, in the order given.
    pub fn start(&mut self, switches: &[Switch], controller: &Controller) -> anyhow::Result<()> {
        self.expect_state(NetworkState::Built, "start")?;

        for switch in switches {
            self.emulator
                .start_switch(switch, controller)
                .context(format!("Failed to start switch {}", switch.name))?;
        }

        self.state = NetworkState::Started;
        debug!("network {}", self.state);
        Ok(())
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.expect_state(NetworkState::Started, "stop")?;

        // the network counts as stopped even if parts of the cleanup failed
        self.state = NetworkState::Stopped;
        debug!("network {}", self.state);
        self.emulator
            .stop()
            .context("Failed to stop the emulated network")
    }

    /// Cleans up a network whose build or start failed. The state is left as it is, so a
    /// discarded network can never claim to have been started or stopped.
    pub fn discard(&mut self) -> anyhow::Result<()> {
        match self.state {
            NetworkState::Started | NetworkState::Stopped => {
                bail!("Cannot discard a {} network", self.state)
            }
            _ if !self.touched => Ok(()),
            _ => {
                warn!("Discarding {} network", self.state);
                self.touched = false;
                self.emulator.stop()
            }
        }
    }

    fn expect_state(&self, expected: NetworkState, action: &str) -> anyhow::Result<()> {
        if self.state != expected {
            bail!(
                "Cannot {} the network: it is {} (expected {})",
                action,
                self.state,
                expected
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        emulator::{dry_run::DryRunEmulator, LaunchRequest},
        process_control::Termination,
    };
    use anyhow::anyhow;
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct Counting {
        builds: usize,
        started: Vec<String>,
        stops: usize,
        fail_build: bool,
    }

    #[async_trait]
    impl Emulator for Counting {
        fn build(&mut self, _topology: &Topology) -> anyhow::Result<()> {
            self.builds += 1;
            if self.fail_build {
                return Err(anyhow!("no such device"));
            }
            Ok(())
        }

        fn start_switch(&mut self, switch: &Switch, _: &Controller) -> anyhow::Result<()> {
            self.started.push(switch.name.clone());
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.stops += 1;
            Ok(())
        }

        fn spawn(&mut self, _request: &LaunchRequest) -> anyhow::Result<u32> {
            Ok(1)
        }

        async fn exec(&mut self, _host: &str, _command: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn is_alive(&mut self, _pid: u32) -> bool {
            true
        }

        fn terminate(&mut self, _pid: u32) -> anyhow::Result<Termination> {
            Ok(Termination::Signalled)
        }
    }

    fn setup() -> anyhow::Result<(Config, Topology)> {
        let config = Config::example()?;
        let topology = Topology::from_config(&config)?;
        Ok((config, topology))
    }

    #[test]
    fn walks_through_every_state() -> anyhow::Result<()> {
        let (config, topology) = setup()?;
        let mut network = NetworkLifecycle::new(Counting::default());
        assert_eq!(network.state(), NetworkState::Unbuilt);

        network.build(&topology)?;
        assert_eq!(network.state(), NetworkState::Built);

        network.start(topology.switches(), &config.controller)?;
        assert_eq!(network.state(), NetworkState::Started);
        assert_eq!(
            network.emulator().started,
            topology
                .switches()
                .iter()
                .map(|sw| sw.name.clone())
                .collect::<Vec<_>>()
        );

        network.stop()?;
        assert_eq!(network.state(), NetworkState::Stopped);
        assert_eq!(network.emulator().stops, 1);
        Ok(())
    }

    #[test]
    fn cannot_skip_or_repeat_states() -> anyhow::Result<()> {
        let (config, topology) = setup()?;
        let mut network = NetworkLifecycle::new(DryRunEmulator::new());

        assert!(network.start(topology.switches(), &config.controller).is_err());
        assert!(network.stop().is_err());

        network.build(&topology)?;
        assert!(network.build(&topology).is_err());
        assert!(network.stop().is_err());

        network.start(topology.switches(), &config.controller)?;
        assert!(network.start(topology.switches(), &config.controller).is_err());

        network.stop()?;
        assert!(network.stop().is_err());
        assert_eq!(network.state(), NetworkState::Stopped);
        Ok(())
    }

    #[test]
    fn failed_build_stays_unbuilt_and_can_be_discarded() -> anyhow::Result<()> {
        let (config, topology) = setup()?;
        let mut network = NetworkLifecycle::new(Counting {
            fail_build: true,
            ..Default::default()
        });

        assert!(network.build(&topology).is_err());
        assert_eq!(network.state(), NetworkState::Unbuilt);
        assert_eq!(network.emulator().builds, 1);
        assert!(network.start(topology.switches(), &config.controller).is_err());
        assert!(network.emulator().started.is_empty());

        network.discard()?;
        network.discard()?;
        assert_eq!(network.emulator().stops, 1);
        assert_eq!(network.state(), NetworkState::Unbuilt);
        Ok(())
    }

    #[test]
    fn untouched_network_needs_no_cleanup() -> anyhow::Result<()> {
        let mut network = NetworkLifecycle::new(Counting::default());
        network.discard()?;
        assert_eq!(network.emulator().stops, 0);
        Ok(())
    }
}
