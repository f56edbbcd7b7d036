pub mod template;

use crate::{
    timeline::Timeline,
    topology::{Link, Switch},
};
use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    fs::{self, File},
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use template::Vars;

static EXAMPLE_CONFIG: &str = include_str!("templates/labrun.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkSettings,
    pub controller: Controller,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub vars: Vars,
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(rename = "switch", default)]
    pub switches: Vec<Switch>,
    #[serde(rename = "host", default)]
    pub hosts: Vec<HostSpec>,
    #[serde(rename = "link", default)]
    pub links: Vec<Link>,
    #[serde(rename = "service", default)]
    pub services: Vec<ProcessSpec>,
    #[serde(rename = "generator", default)]
    pub generators: Vec<ProcessSpec>,
    #[serde(rename = "capture", default)]
    pub captures: Vec<ProcessSpec>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create {}", path.to_string_lossy()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    /// The bundled "simple-polska" scenario.
    pub fn example() -> anyhow::Result<Config> {
        Config::try_from_str(EXAMPLE_CONFIG)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config {}", path.to_string_lossy()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything about the scenario that can be checked without touching the system:
    /// host references, templates, generator seeds and every command line rendering cleanly.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for spec in self.process_specs() {
            if !names.insert(spec.name.as_str()) {
                bail!("Duplicate process name `{}`", spec.name);
            }
            self.find_host(&spec.host)
                .context(format!("Process `{}` runs on an unknown host", spec.name))?;
        }

        for spec in self.services.iter().chain(self.captures.iter()) {
            if spec.seed.is_some() {
                bail!("Only generators take a seed (found one on `{}`)", spec.name);
            }
        }

        let mut seeds = HashSet::new();
        for spec in self.generators.iter() {
            let seed = spec
                .seed
                .context(format!("Generator `{}` needs a seed", spec.name))?;
            if !seeds.insert(seed) {
                bail!("Generator `{}` reuses seed {}", spec.name, seed);
            }
        }

        for spec in self.process_specs() {
            self.render_command(spec)?;
            self.render_probe(spec)?;
        }

        if let Some(launch) = &self.controller.launch {
            self.render(&launch.command, &self.builtins())
                .context("Invalid controller launch command")?;
        }

        Ok(())
    }

    /// Services, captures and generators in that order.
    pub fn process_specs(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.services
            .iter()
            .chain(self.captures.iter())
            .chain(self.generators.iter())
    }

    pub fn find_host(&self, host_name: &str) -> anyhow::Result<&HostSpec> {
        self.hosts
            .iter()
            .find(|host| host.name == host_name)
            .context(format!("Unable to find host with name {}", host_name))
    }

    pub fn find_template(&self, template_name: &str) -> anyhow::Result<&String> {
        self.templates
            .get(template_name)
            .context(format!("Unable to find template with name {}", template_name))
    }

    /// Address of the given host. Hosts without an explicit address get the n-th address of
    /// `network.ip_base`, n being the host's 1-based position in the host list.
    pub fn host_address(&self, host_name: &str) -> anyhow::Result<Ipv4Net> {
        let (idx, host) = self
            .hosts
            .iter()
            .find_position(|host| host.name == host_name)
            .context(format!("Unable to find host with name {}", host_name))?;

        if let Some(ip) = host.ip {
            return Ok(ip);
        }

        let base = self.network.ip_base;
        let addr = u32::from(base.network())
            .checked_add(idx as u32 + 1)
            .map(Ipv4Addr::from)
            .filter(|addr| base.contains(addr) && *addr != base.broadcast())
            .context(format!(
                "Address space {} is exhausted at host {}",
                base, host_name
            ))?;

        Ok(Ipv4Net::new(addr, base.prefix_len())?)
    }

    /// Renders the command line of a process spec, either its inline command or the named
    /// template, with the builtin variables `name`, `host`, `ip`, `output_dir` and `seed`.
    pub fn render_command(&self, spec: &ProcessSpec) -> anyhow::Result<String> {
        let source = match (&spec.template, &spec.command) {
            (Some(template), None) => self.find_template(template)?,
            (None, Some(command)) => command,
            (Some(_), Some(_)) => bail!(
                "Process `{}` must have either a template or a command, not both",
                spec.name
            ),
            (None, None) => bail!("Process `{}` has neither template nor command", spec.name),
        };

        self.render_for(spec, source)
            .context(format!("Unable to render command for `{}`", spec.name))
    }

    /// Renders the readiness probe of a process spec, if it has one.
    pub fn render_probe(&self, spec: &ProcessSpec) -> anyhow::Result<Option<String>> {
        spec.ready
            .as_ref()
            .map(|probe| {
                self.render_for(spec, &probe.command)
                    .context(format!("Unable to render ready probe for `{}`", spec.name))
            })
            .transpose()
    }

    fn render_for(&self, spec: &ProcessSpec, source: &str) -> anyhow::Result<String> {
        let mut builtins = self.builtins();
        builtins.insert("name".to_string(), spec.name.clone());
        builtins.insert("host".to_string(), spec.host.clone());
        builtins.insert(
            "ip".to_string(),
            self.host_address(&spec.host)?.addr().to_string(),
        );
        if let Some(seed) = spec.seed {
            builtins.insert("seed".to_string(), seed.to_string());
        }

        let mut scope = spec.vars.clone();
        scope.extend(builtins);

        self.render(source, &scope)
    }

    /// Variables every command sees, ahead of entry and global vars.
    fn builtins(&self) -> Vars {
        let mut builtins = Vars::new();
        builtins.insert(
            "output_dir".to_string(),
            self.network.output_dir.to_string_lossy().to_string(),
        );
        builtins
    }

    fn render(&self, source: &str, scope: &Vars) -> anyhow::Result<String> {
        template::render(source, &[scope, &self.vars])
    }

    pub fn render_controller_command(&self) -> anyhow::Result<Option<String>> {
        self.controller
            .launch
            .as_ref()
            .map(|launch| self.render(&launch.command, &self.builtins()))
            .transpose()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NetworkSettings {
    #[serde(default = "default_ip_base")]
    pub ip_base: Ipv4Net,
    #[serde(default = "default_true")]
    pub static_arp: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}
impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            ip_base: default_ip_base(),
            static_arp: true,
            output_dir: default_output_dir(),
        }
    }
}

fn default_ip_base() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24).expect("24 is a valid prefix length")
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Ssl,
}
impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Ssl => write!(f, "ssl"),
        }
    }
}

/// The remote SDN controller the switches attach to.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Controller {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_port")]
    pub port: u16,
    pub launch: Option<ControllerLaunch>,
}
impl Controller {
    /// Connection target in Open vSwitch notation, e.g. `tcp:172.17.0.1:6653`.
    pub fn target(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{}:{}:{}", self.protocol, ip, self.port),
            IpAddr::V6(ip) => format!("{}:[{}]:{}", self.protocol, ip, self.port),
        }
    }
}

fn default_port() -> u16 {
    6653
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ControllerLaunch {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub redirect: Option<Redirect>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HostSpec {
    pub name: String,
    pub ip: Option<Ipv4Net>,
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReadyProbe {
    pub command: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
    #[serde(default = "default_probe_interval")]
    pub interval: u64,
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    1
}

/// A service, generator or capture started on an emulated host.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub host: String,
    pub template: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub vars: Vars,
    pub redirect: Option<Redirect>,
    pub ready: Option<ReadyProbe>,
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [controller]
        name = "c0"
        ip = "127.0.0.1"

        [[switch]]
        name = "s1"
        dpid = 1

        [[host]]
        name = "h1"

        [[host]]
        name = "h2"
        ip = "192.168.1.7/16"

        [[link]]
        a = "s1"
        b = "h1"
        bw = 10
    "#;

    fn with(extra: &str) -> String {
        format!("{}\n{}", MINIMAL, extra)
    }

    #[test]
    fn can_load_config_file() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/labrun.minimal.toml"))?;
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.generators.len(), 2);
        Ok(())
    }

    #[test]
    fn example_config_is_valid() -> anyhow::Result<()> {
        let cfg = Config::example()?;
        assert_eq!(cfg.switches.len(), 12);
        assert_eq!(cfg.services.len(), 5);
        assert_eq!(cfg.generators.len(), 7);
        assert_eq!(cfg.captures.len(), 1);
        assert_eq!(cfg.controller.target(), "tcp:172.17.0.1:6653");
        Ok(())
    }

    #[test]
    fn example_commands_render_simple_polska_invocations() -> anyhow::Result<()> {
        let cfg = Config::example()?;

        let service = cfg.render_command(&cfg.services[0])?;
        assert_eq!(
            service,
            "java -jar /impl/http-server/target/http-server-0.0.1-SNAPSHOT.jar \
             --usersFile=/impl/floodlight/scenarios/simple-polska/users.json \
             --servicesFile=/impl/floodlight/scenarios/simple-polska/mininet/services.json \
             --logging.file=./service-one.log --exitStatsFile=./service-one-exit.xlsx"
        );

        let generator = cfg.render_command(&cfg.generators[1])?;
        assert_eq!(
            generator,
            "java -jar /impl/requests-generator/target/requests-generator-1.0-SNAPSHOT.jar \
             -sf /impl/floodlight/scenarios/simple-polska/mininet/services.json -lf user-two \
             -st ./user-two-exit.xlsx -er ./user-two-every-request.xlsx -s 22222 -g uniform \
             -ming 5 -maxg 10"
        );

        let capture = cfg.render_command(&cfg.captures[0])?;
        assert_eq!(capture, "tcpdump -i any -w ./user-one.pcap");

        Ok(())
    }

    #[test]
    fn defaults_are_applied() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(MINIMAL)?;
        assert_eq!(cfg.network, NetworkSettings::default());
        assert_eq!(cfg.timeline, Timeline::default());
        assert_eq!(cfg.controller.port, 6653);
        assert_eq!(cfg.controller.protocol, Protocol::Tcp);
        Ok(())
    }

    #[test]
    fn hosts_without_address_are_numbered_from_ip_base() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(MINIMAL)?;
        assert_eq!(cfg.host_address("h1")?, "10.0.0.1/24".parse::<Ipv4Net>()?);
        assert_eq!(cfg.host_address("h2")?, "192.168.1.7/16".parse::<Ipv4Net>()?);
        assert!(cfg.host_address("h3").is_err());
        Ok(())
    }

    #[test]
    fn ip_base_can_run_out() {
        let cfg = format!(
            "[network]\nip_base = \"10.0.0.0/31\"\n{}",
            MINIMAL.replace("name = \"h2\"\n        ip = \"192.168.1.7/16\"", "name = \"h2\"")
        );
        let res = Config::try_from_str(&cfg).and_then(|cfg| cfg.host_address("h2"));
        assert!(res.is_err());
    }

    #[test]
    fn unknown_hosts_are_rejected() {
        let cfg = with(
            r#"
            [[service]]
            name = "svc"
            host = "nowhere"
            command = "true"
            "#,
        );
        assert!(Config::try_from_str(&cfg).is_err());
    }

    #[test]
    fn generators_need_distinct_seeds() {
        let missing = with(
            r#"
            [[generator]]
            name = "g1"
            host = "h1"
            command = "gen -s {seed}"
            "#,
        );
        assert!(Config::try_from_str(&missing).is_err());

        let reused = with(
            r#"
            [[generator]]
            name = "g1"
            host = "h1"
            command = "gen -s {seed}"
            seed = 1

            [[generator]]
            name = "g2"
            host = "h2"
            command = "gen -s {seed}"
            seed = 1
            "#,
        );
        assert!(Config::try_from_str(&reused).is_err());
    }

    #[test]
    fn template_and_command_are_exclusive() {
        let both = with(
            r#"
            [templates]
            t = "true"

            [[service]]
            name = "svc"
            host = "h1"
            template = "t"
            command = "true"
            "#,
        );
        assert!(Config::try_from_str(&both).is_err());

        let neither = with(
            r#"
            [[service]]
            name = "svc"
            host = "h1"
            "#,
        );
        assert!(Config::try_from_str(&neither).is_err());
    }

    #[test]
    fn undefined_variables_fail_validation() {
        let cfg = with(
            r#"
            [[service]]
            name = "svc"
            host = "h1"
            command = "serve --port {port}"
            "#,
        );
        let err = Config::try_from_str(&cfg).unwrap_err();
        assert!(format!("{:#}", err).contains("port"));
    }

    #[test]
    fn builtin_variables_are_available() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(&with(
            r#"
            [[service]]
            name = "svc"
            host = "h1"
            command = "serve --bind {ip} --name {name}@{host} --out {output_dir}"
            "#,
        ))?;
        assert_eq!(
            cfg.render_command(&cfg.services[0])?,
            "serve --bind 10.0.0.1 --name svc@h1 --out ."
        );
        Ok(())
    }

    #[test]
    fn output_dir_cannot_be_shadowed_by_vars() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(&format!(
            "[network]\noutput_dir = \"/data/run\"\n\n[vars]\noutput_dir = \"/tmp/elsewhere\"\n{}",
            with(
                r#"
                [controller.launch]
                command = "ctl --log {output_dir}/ctl.log"

                [[service]]
                name = "svc"
                host = "h1"
                command = "serve --out {output_dir}"

                [[service]]
                name = "other"
                host = "h2"
                command = "serve --out {output_dir}"
                vars = { output_dir = "/entry" }
                "#
            )
        ))?;

        assert_eq!(cfg.render_command(&cfg.services[0])?, "serve --out /data/run");
        assert_eq!(cfg.render_command(&cfg.services[1])?, "serve --out /data/run");
        assert_eq!(
            cfg.render_controller_command()?.as_deref(),
            Some("ctl --log /data/run/ctl.log")
        );
        Ok(())
    }

    #[test]
    fn controller_target_formats_ipv6() -> anyhow::Result<()> {
        let controller = Controller {
            name: "c0".to_string(),
            ip: "::1".parse()?,
            protocol: Protocol::Ssl,
            port: 6633,
            launch: None,
        };
        assert_eq!(controller.target(), "ssl:[::1]:6633");
        Ok(())
    }
}
