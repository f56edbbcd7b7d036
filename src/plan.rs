use crate::{
    config::{Config, ProcessSpec},
    process_control::Role,
    timeline::{Phase, Timeline},
    topology::Topology,
};
use colored::Colorize;
use itertools::Itertools;
use std::time::Duration;
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLaunch {
    pub offset: Duration,
    pub role: Role,
    pub name: String,
    pub host: String,
    pub command: String,
}

/// When each process of a scenario is expected to start, assuming every launch is instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub network_start: Duration,
    pub launches: Vec<PlannedLaunch>,
    pub shutdown: Duration,
}

impl Plan {
    pub fn new(config: &Config, timeline: &Timeline) -> anyhow::Result<Plan> {
        let mut launches = vec![];
        let mut now = Duration::ZERO;

        if let Some(command) = config.render_controller_command()? {
            launches.push(PlannedLaunch {
                offset: now,
                role: Role::Controller,
                name: config.controller.name.clone(),
                host: "local".to_string(),
                command,
            });
            now += timeline.duration(Phase::ControllerStartup);
        }

        let network_start = now;
        now += timeline.duration(Phase::Settle);

        let mut push = |offset: Duration, role: Role, spec: &ProcessSpec| -> anyhow::Result<()> {
            launches.push(PlannedLaunch {
                offset,
                role,
                name: spec.name.clone(),
                host: spec.host.clone(),
                command: config.render_command(spec)?,
            });
            Ok(())
        };

        for spec in config.services.iter() {
            push(now, Role::Service, spec)?;
        }
        now += timeline.duration(Phase::ServiceWarmup);

        for spec in config.captures.iter() {
            push(now, Role::Capture, spec)?;
        }
        now += timeline.duration(Phase::PreGenerator);

        for (idx, spec) in config.generators.iter().enumerate() {
            if idx > 0 {
                now += timeline.duration(Phase::Stagger);
            }
            push(now, Role::Generator, spec)?;
        }
        now += timeline.duration(Phase::Hold);

        Ok(Plan {
            network_start,
            launches,
            shutdown: now,
        })
    }

    pub fn print(&self, config: &Config, timeline: &Timeline, topology: &Topology) {
        println!("\n{}", " Topology ".reversed().green());
        println!(
            "{} switches, {} hosts, {} links -> controller {} at {}",
            topology.switches().len(),
            topology.hosts().len(),
            topology.links().len(),
            config.controller.name.green(),
            config.controller.target()
        );

        println!("\n{}", " Timeline ".reversed().green());
        let phases = timeline
            .phases()
            .map(|(phase, duration)| format!("{} {}s", phase, duration.as_secs()))
            .join(", ");
        println!("{}", phases);
        println!("teardown starts after {}s", self.shutdown.as_secs());

        println!("\n{}", " Schedule ".reversed().green());
        let mut rows = vec![Row::new(vec![
            TableCell::new("t (s)".bold()),
            TableCell::new("Role".bold()),
            TableCell::new("Name".bold()),
            TableCell::new("Host".bold()),
            TableCell::new("Command".bold()),
        ])];
        rows.push(Row::new(vec![
            TableCell::new(self.network_start.as_secs()),
            TableCell::new("network"),
            TableCell::new("--"),
            TableCell::new("--"),
            TableCell::new("build + attach switches"),
        ]));
        for launch in self.launches.iter() {
            rows.push(Row::new(vec![
                TableCell::new(launch.offset.as_secs()),
                TableCell::new(launch.role),
                TableCell::new(&launch.name),
                TableCell::new(&launch.host),
                TableCell::new(&launch.command),
            ]));
        }
        rows.push(Row::new(vec![
            TableCell::new(self.shutdown.as_secs()),
            TableCell::new("teardown"),
            TableCell::new("--"),
            TableCell::new("--"),
            TableCell::new("stop everything"),
        ]));

        let table = Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build();
        println!("{}", table.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_schedule_follows_default_timeline() -> anyhow::Result<()> {
        let config = Config::example()?;
        let plan = Plan::new(&config, &config.timeline)?;

        assert_eq!(plan.network_start, Duration::ZERO);
        let offsets = |role| {
            plan.launches
                .iter()
                .filter(|launch| launch.role == role)
                .map(|launch| launch.offset.as_secs())
                .collect::<Vec<_>>()
        };
        assert_eq!(offsets(Role::Service), vec![15; 5]);
        assert_eq!(offsets(Role::Capture), vec![25]);
        assert_eq!(
            offsets(Role::Generator),
            vec![95, 105, 115, 125, 135, 145, 155]
        );
        assert_eq!(plan.shutdown, Duration::from_secs(755));
        assert_eq!(
            plan.shutdown,
            config.timeline.scripted_duration(config.generators.len(), false)
        );
        Ok(())
    }

    #[test]
    fn controller_launch_shifts_everything() -> anyhow::Result<()> {
        let mut config = Config::example()?;
        config.controller.launch = Some(crate::config::ControllerLaunch {
            command: "ryu-manager app.py".to_string(),
            cwd: None,
            redirect: None,
        });

        let plan = Plan::new(&config, &config.timeline)?;
        assert_eq!(plan.launches[0].role, Role::Controller);
        assert_eq!(plan.launches[0].offset, Duration::ZERO);
        assert_eq!(plan.network_start, Duration::from_secs(5));
        assert_eq!(plan.shutdown, Duration::from_secs(760));
        Ok(())
    }

    #[test]
    fn instant_timeline_collapses_offsets() -> anyhow::Result<()> {
        let config = Config::example()?;
        let plan = Plan::new(&config, &Timeline::instant())?;
        assert!(plan.launches.iter().all(|launch| launch.offset.is_zero()));
        assert_eq!(plan.shutdown, Duration::ZERO);
        Ok(())
    }
}
