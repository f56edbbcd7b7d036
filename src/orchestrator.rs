use crate::{
    config::{Config, ProcessSpec, ReadyProbe, Redirect},
    emulator::{Emulator, LaunchRequest},
    lifecycle::{NetworkLifecycle, NetworkState},
    process_control::{ProcessHandle, Role, Termination},
    report::RunReport,
    timeline::{self, Cancelled, Phase, Timeline},
    topology::Topology,
};
use anyhow::{bail, Context};
use colored::Colorize;
use nanoid::nanoid;
use std::{path::Path, time::Duration};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs one experiment: brings up the network, starts services, captures and generators on
/// the emulated hosts according to the timeline, then tears everything down again.
pub struct Orchestrator<E: Emulator> {
    config: Config,
    topology: Topology,
    timeline: Timeline,
    network: NetworkLifecycle<E>,
    token: CancellationToken,
    started: Instant,
    controller: Option<ProcessHandle>,
    services: Vec<ProcessHandle>,
    captures: Vec<ProcessHandle>,
    generators: Vec<ProcessHandle>,
    report: RunReport,
}

impl<E: Emulator> Orchestrator<E> {
    pub fn new(config: Config, emulator: E, token: CancellationToken) -> anyhow::Result<Self> {
        let topology = Topology::from_config(&config).context("Invalid topology")?;
        let run_id = nanoid!(5, &nanoid::alphabet::SAFE);

        Ok(Orchestrator {
            timeline: config.timeline.clone(),
            config,
            topology,
            network: NetworkLifecycle::new(emulator),
            token,
            started: Instant::now(),
            controller: None,
            services: vec![],
            captures: vec![],
            generators: vec![],
            report: RunReport::new(&run_id),
        })
    }

    /// Replaces the timeline read from the config.
    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn network(&self) -> &NetworkLifecycle<E> {
        &self.network
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }

    /// Runs the experiment to completion. Teardown happens whether the run succeeds, fails or
    /// is cancelled. The first error wins; errors during teardown are only logged if the run
    /// already failed.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.started = Instant::now();
        println!(
            "> running experiment {} ({} switches, {} hosts, {} links)",
            self.report.run_id.green(),
            self.topology.switches().len(),
            self.topology.hosts().len(),
            self.topology.links().len()
        );

        let outcome = self.run_phases().await;
        if let Err(err) = &outcome {
            warn!("Experiment aborted: {:#}", err);
        }

        let teardown = self.teardown();
        let result = match (outcome, teardown) {
            (Err(err), Err(teardown_err)) => {
                warn!("Teardown failed as well: {:#}", teardown_err);
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), teardown) => teardown,
        };

        self.report.finish(&result);
        result
    }

    async fn run_phases(&mut self) -> anyhow::Result<()> {
        if let Some(launch) = self.config.controller.launch.clone() {
            let command = self.config.render_controller_command()?.unwrap_or_default();
            let cwd = launch
                .cwd
                .clone()
                .unwrap_or_else(|| self.config.network.output_dir.clone());
            let name = self.config.controller.name.clone();

            let handle = self.launch(
                Role::Controller,
                &name,
                None,
                &command,
                launch.redirect.unwrap_or_default(),
                &cwd,
            )?;
            self.controller = Some(handle.clone());

            self.wait(Phase::ControllerStartup).await?;
            self.ensure_alive(&handle)?;
        }

        println!("> building network");
        self.network.build(&self.topology)?;

        println!(
            "> attaching switches to {}",
            self.config.controller.target().green()
        );
        self.network
            .start(self.topology.switches(), &self.config.controller)?;
        self.wait(Phase::Settle).await?;

        let services = self.config.services.clone();
        for spec in services.iter() {
            let handle = self.launch_spec(Role::Service, spec)?;
            self.services.push(handle);
        }
        self.wait(Phase::ServiceWarmup).await?;

        for (handle, spec) in self.services.clone().iter().zip(services.iter()) {
            self.ensure_alive(handle)?;
            if let Some(probe) = &spec.ready {
                self.await_ready(handle, spec, probe).await?;
            }
        }

        for spec in self.config.captures.clone().iter() {
            let handle = self.launch_spec(Role::Capture, spec)?;
            self.captures.push(handle);
        }
        self.wait(Phase::PreGenerator).await?;

        for handle in self.captures.clone().iter() {
            self.ensure_alive(handle)?;
        }

        for (idx, spec) in self.config.generators.clone().iter().enumerate() {
            if idx > 0 {
                self.wait(Phase::Stagger).await?;
                if let Some(previous) = self.generators.last().cloned() {
                    self.ensure_alive(&previous)?;
                }
            }
            let handle = self.launch_spec(Role::Generator, spec)?;
            self.generators.push(handle);
        }

        // the last generator gets the same grace as the others, carved out of the hold
        let hold = self.timeline.duration(Phase::Hold);
        let grace = hold.min(self.timeline.duration(Phase::Stagger));
        self.announce_wait(hold, Phase::Hold);
        timeline::pause(grace, &self.token).await?;
        if let Some(last) = self.generators.last().cloned() {
            self.ensure_alive(&last)?;
        }
        timeline::pause(hold - grace, &self.token).await?;

        for handle in self.generators.iter() {
            if !self.network.emulator_mut().is_alive(handle.pid) {
                warn!(
                    "Generator {} (pid {}) exited before the end of the hold",
                    handle.name, handle.pid
                );
            }
        }

        Ok(())
    }

    /// Stops everything the run started: generators, services and captures in launch order,
    /// then the network, then a locally launched controller. Failing to stop a process is
    /// recorded but does not stop the teardown. Calling it again is a no-op.
    pub fn teardown(&mut self) -> anyhow::Result<()> {
        let generators = std::mem::take(&mut self.generators);
        let services = std::mem::take(&mut self.services);
        let captures = std::mem::take(&mut self.captures);

        for handle in generators.iter().chain(services.iter()).chain(captures.iter()) {
            self.terminate(handle);
        }

        let network = match self.network.state() {
            NetworkState::Started => {
                println!("> stopping network");
                self.network.stop()
            }
            NetworkState::Stopped => Ok(()),
            NetworkState::Unbuilt | NetworkState::Built => self.network.discard(),
        };

        if let Some(controller) = self.controller.take() {
            self.terminate(&controller);
        }

        network
    }

    /// Starts one process and records it. `host` is `None` for processes on the local machine.
    pub fn launch(
        &mut self,
        role: Role,
        name: &str,
        host: Option<&str>,
        command: &str,
        redirect: Redirect,
        cwd: &Path,
    ) -> anyhow::Result<ProcessHandle> {
        let request = LaunchRequest {
            host,
            name,
            command,
            redirect,
            cwd,
        };
        let pid = self
            .network
            .emulator_mut()
            .spawn(&request)
            .context(format!("Failed to launch {} {}", role, name))?;

        let handle = ProcessHandle {
            role,
            name: name.to_string(),
            host: host.map(str::to_string),
            command: command.to_string(),
            pid,
        };
        self.report.record_launch(&handle, self.started.elapsed());

        println!(
            "> started {} {} on {}\t{}",
            role,
            name.green(),
            handle.location(),
            format!("pid {}", pid).bright_black()
        );
        debug!("{} $ {}", handle.location(), command);

        Ok(handle)
    }

    /// Stops one process and records the outcome. Errors are logged, never returned.
    pub fn terminate(&mut self, handle: &ProcessHandle) -> Option<Termination> {
        print!("> stopping {} {}", handle.role, handle.name.green());

        let result = self.network.emulator_mut().terminate(handle.pid);
        match &result {
            Ok(Termination::Signalled) => println!("\t{}", "✓".green()),
            Ok(Termination::AlreadyGone) => {
                println!("\t{}", "already gone".bright_black());
                info!("{} {} (pid {}) had already exited", handle.role, handle.name, handle.pid);
            }
            Err(err) => {
                println!();
                warn!(
                    "Failed to stop {} {} (pid {})\n{:#}",
                    handle.role, handle.name, handle.pid, err
                );
            }
        }

        self.report
            .record_termination(handle, &result, self.started.elapsed());
        result.ok()
    }

    fn launch_spec(&mut self, role: Role, spec: &ProcessSpec) -> anyhow::Result<ProcessHandle> {
        let command = self.config.render_command(spec)?;
        let cwd = self.config.network.output_dir.clone();
        self.launch(
            role,
            &spec.name,
            Some(&spec.host),
            &command,
            spec.redirect.unwrap_or_default(),
            &cwd,
        )
    }

    fn ensure_alive(&mut self, handle: &ProcessHandle) -> anyhow::Result<()> {
        if !self.network.emulator_mut().is_alive(handle.pid) {
            bail!(
                "{} {} on {} (pid {}) is not running",
                handle.role,
                handle.name,
                handle.location(),
                handle.pid
            );
        }
        Ok(())
    }

    /// Polls the probe command on the service's host until it succeeds or the probe times out.
    async fn await_ready(
        &mut self,
        handle: &ProcessHandle,
        spec: &ProcessSpec,
        probe: &ReadyProbe,
    ) -> anyhow::Result<()> {
        let command = self
            .config
            .render_probe(spec)?
            .unwrap_or_else(|| probe.command.clone());
        let deadline = Instant::now() + Duration::from_secs(probe.timeout);
        let interval = Duration::from_secs(probe.interval.max(1));

        loop {
            // a hanging check must neither outlive the deadline nor block cancellation
            let check = self.network.emulator_mut().exec(&spec.host, &command);
            let attempt = tokio::select! {
                res = timeout_at(deadline, check) => res,
                _ = self.token.cancelled() => return Err(Cancelled.into()),
            };

            match attempt {
                Ok(Ok(true)) => {
                    debug!("{} {} is ready", handle.role, handle.name);
                    return Ok(());
                }
                Ok(Ok(false)) if Instant::now() < deadline => {
                    timeline::pause(interval, &self.token).await?;
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(false)) | Err(_) => bail!(
                    "{} {} did not become ready within {}s",
                    handle.role,
                    handle.name,
                    probe.timeout
                ),
            }
        }
    }

    async fn wait(&self, phase: Phase) -> anyhow::Result<()> {
        self.announce_wait(self.timeline.duration(phase), phase);
        self.timeline.wait(phase, &self.token).await?;
        Ok(())
    }

    fn announce_wait(&self, duration: Duration, phase: Phase) {
        if !duration.is_zero() {
            println!(
                "> waiting {}s {}",
                duration.as_secs(),
                format!("({})", phase).bright_black()
            );
        }
    }
}
