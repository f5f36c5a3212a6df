// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    collections::{BTreeMap, HashSet},
    error::Error,
    path::Path,
    time::Duration,
};

use config::{Config, Environment, File, FileFormat, Map, Source};
use duration_string::DurationString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    bindings::{self, Action},
    broadcast::OscBroadcaster,
    control::{ControlLoop, Stage},
    devices::{DeviceManager, StripDevice},
    input::{self, Keyboards},
    protocol::{transport, Bus},
    registry::Registry,
    timing::{self, Timebase, MAX_BPM, MIN_BPM},
};

pub mod broadcast;
pub mod bus;
pub mod error;
pub mod keyboard;

pub use error::ConfigError;

/// Environment variables with this prefix override file settings, with `__`
/// between nested keys: `CURSEDLIGHT_BUS__PORT=/dev/ttyUSB1`.
pub const ENV_PREFIX: &str = "CURSEDLIGHT";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_BPM: f64 = 120.0;

/// The top level configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    /// The shared addressed bus.
    bus: bus::Bus,

    /// Point-to-point strips.
    #[serde(default)]
    strips: Vec<bus::Strip>,

    /// Strips get a tick every this many sub-beats. Every tick when unset.
    strip_tick_divisor: Option<u8>,

    /// Named device groups.
    #[serde(default)]
    groups: Vec<bus::Group>,

    /// Per-device color correction.
    #[serde(default)]
    calibration: Vec<bus::Calibration>,

    /// The OSC beat broadcaster.
    broadcast: Option<broadcast::Broadcast>,

    /// Which keyboard drives which group.
    #[serde(default)]
    keyboards: Vec<keyboard::KeyboardMapping>,

    /// Key bindings. The master layout is used when empty.
    #[serde(default)]
    bindings: Vec<keyboard::Binding>,

    /// How long the control loop sleeps between iterations.
    poll_interval: Option<String>,

    /// The tempo at startup.
    initial_bpm: Option<f64>,
}

impl Settings {
    /// Loads settings from a file, applying environment overrides.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        Self::build(File::from(path), None)
    }

    /// Parses settings from YAML. The environment is ignored.
    pub fn from_yaml(yaml: &str) -> Result<Settings, ConfigError> {
        Self::build(File::from_str(yaml, FileFormat::Yaml), Some(Map::new()))
    }

    fn build<S>(file: S, env: Option<Map<String, String>>) -> Result<Settings, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks everything serde can't.
    fn validate(&self) -> Result<(), ConfigError> {
        self.bus.frame_delay()?;
        for strip in self.strips.iter() {
            strip.frame_delay()?;
        }
        self.poll_interval()?;

        let bpm = self.initial_bpm();
        if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            return Err(ConfigError::Invalid(format!(
                "initial BPM {} is outside {}..={}",
                bpm, MIN_BPM, MAX_BPM
            )));
        }

        let mut names = HashSet::new();
        for group in self.groups.iter() {
            if !names.insert(group.name()) {
                return Err(ConfigError::Invalid(format!(
                    "device group {} is defined twice",
                    group.name()
                )));
            }
        }

        for calibration in self.calibration.iter() {
            if calibration.bytes().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "calibration for {:#06x} must be between 0 and 1",
                    calibration.address()
                )));
            }
        }

        for mapping in self.keyboards.iter() {
            self.check_group(mapping.group())?;
        }

        for binding in self.bindings.iter() {
            binding.key().code().map_err(ConfigError::Invalid)?;
            match binding.action() {
                Action::ToggleEffect { group, effect, .. } => {
                    if let Some(group) = group {
                        self.check_group(group)?;
                    }
                    effect.check().map_err(ConfigError::Invalid)?;
                }
                Action::ResetGroup { group } => self.check_group(group)?,
                Action::StripStrobe { strip, .. } => {
                    if !self.strips.iter().any(|s| s.name() == strip) {
                        return Err(ConfigError::Invalid(format!("unknown strip {}", strip)));
                    }
                }
                Action::Quantize { nearest } if *nearest <= 0.0 => {
                    return Err(ConfigError::Invalid(format!(
                        "quantize step {} must be positive",
                        nearest
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_group(&self, name: &str) -> Result<(), ConfigError> {
        if self.groups.iter().any(|group| group.name() == name) {
            return Ok(());
        }
        Err(ConfigError::Invalid(format!("unknown device group {}", name)))
    }

    pub fn bus(&self) -> &bus::Bus {
        &self.bus
    }

    pub fn strips(&self) -> &[bus::Strip] {
        &self.strips
    }

    pub fn strip_tick_divisor(&self) -> Option<u8> {
        self.strip_tick_divisor
    }

    pub fn groups(&self) -> &[bus::Group] {
        &self.groups
    }

    /// Group name -> addresses.
    pub fn group_addresses(&self) -> BTreeMap<String, Vec<u16>> {
        self.groups
            .iter()
            .map(|group| (group.name().to_string(), group.addresses()))
            .collect()
    }

    /// Address -> calibration bytes.
    pub fn calibration(&self) -> BTreeMap<u16, [u8; 4]> {
        self.calibration
            .iter()
            .filter_map(|c| c.bytes().map(|bytes| (c.address(), bytes)))
            .collect()
    }

    pub fn broadcast(&self) -> Option<&broadcast::Broadcast> {
        self.broadcast.as_ref()
    }

    /// The groups a keyboard drives by default.
    pub fn keyboard_groups(&self, keyboard: usize) -> Vec<String> {
        self.keyboards
            .iter()
            .filter(|mapping| mapping.keyboard() == keyboard)
            .map(|mapping| mapping.group().to_string())
            .collect()
    }

    /// Keyboard id -> bindings. Falls back to the master layout on keyboard 0.
    pub fn bindings(&self) -> Result<BTreeMap<usize, Vec<bindings::Binding>>, ConfigError> {
        let mut result: BTreeMap<usize, Vec<bindings::Binding>> = BTreeMap::new();
        if self.bindings.is_empty() {
            let first_group = self.groups.first().map(|group| group.name());
            result.insert(0, bindings::default_bindings(first_group));
            return Ok(result);
        }
        for binding in self.bindings.iter() {
            let key = binding.key().code().map_err(ConfigError::Invalid)?;
            result
                .entry(binding.keyboard())
                .or_default()
                .push(bindings::Binding {
                    key,
                    action: binding.action().clone(),
                });
        }
        Ok(result)
    }

    pub fn poll_interval(&self) -> Result<Duration, duration_string::Error> {
        self.poll_interval
            .as_ref()
            .map_or(Ok(DEFAULT_POLL_INTERVAL), |duration| {
                Ok(DurationString::from_string(duration.clone())?.into())
            })
    }

    pub fn initial_bpm(&self) -> f64 {
        self.initial_bpm.unwrap_or(DEFAULT_BPM)
    }
}

/// Opens every device and keyboard named in the settings and builds the
/// control loop. Frames are only logged when `dry_run` is set.
pub async fn init_control_loop(
    settings: &Settings,
    dry_run: bool,
) -> Result<ControlLoop, Box<dyn Error>> {
    let bus_config = settings.bus();
    let dry_run = dry_run || bus_config.dry_run();

    let transport = transport::open(
        bus_config.port(),
        bus_config.baud(),
        bus_config.frame_delay()?,
        dry_run,
    )?;
    let mut bus = Bus::new(transport, bus_config.broadcast_address());
    for group in settings.groups() {
        for device in group.devices() {
            bus.add_device(device.address(), &device.label());
        }
    }

    let mut registry = Registry::new(bus, settings.calibration(), bus_config.tick_divisor());
    if let Some(osc) = settings.broadcast().filter(|b| b.enabled()) {
        let broadcaster = OscBroadcaster::new(
            osc.bind()?,
            osc.targets()?,
            osc.sub_beat_divisor(),
            osc.scenes(),
        )
        .await?;
        registry.set_listener(Box::new(broadcaster));
    }

    let mut devices = DeviceManager::new(settings.strip_tick_divisor());
    for strip in settings.strips() {
        let transport = transport::open(strip.port(), strip.baud(), strip.frame_delay()?, dry_run)?;
        devices.add_device(Box::new(StripDevice::new(
            strip.name(),
            strip.address(),
            strip.flags(),
            transport,
        )));
    }

    let mut keyboards = Keyboards::new();
    let attached = input::evdev::attach_all(&mut keyboards)?;
    if attached == 0 {
        warn!("No keyboards found; only the beat will run.");
    }

    let stage = Stage::new(
        Timebase::new(timing::now(), settings.initial_bpm()),
        registry,
        devices,
        settings.group_addresses(),
    );
    let mut control = ControlLoop::new(stage, keyboards, settings.poll_interval()?);
    for (keyboard, keyboard_bindings) in settings.bindings()? {
        info!(
            keyboard,
            bindings = keyboard_bindings.len(),
            "Registering key bindings."
        );
        control.register(
            keyboard,
            bindings::handler(keyboard_bindings, settings.keyboard_groups(keyboard)),
        );
    }
    Ok(control)
}

#[cfg(test)]
mod test {
    use std::{io::Write, time::Duration};

    use config::{File, Map};

    use crate::{
        bindings::Action,
        effects::{Color, EffectKind},
    };

    use super::{ConfigError, Settings};

    const FULL: &str = r##"
bus:
  port: /dev/ttyUSB0
  baud: 57600
  frame_delay: 1ms
  broadcast_address: 0x7fff
  tick_divisor: 30
strips:
  - name: bar top
    port: /dev/ttyACM0
    address: 2
    flags: 16
strip_tick_divisor: 60
groups:
  - name: bar
    devices:
      - address: 0x0003
        label: Bar left
      - address: 0x0004
  - name: hall
    devices:
      - address: 0x0030
calibration:
  - address: 3
    rgba: [1, 0.4, 0.4, 1]
broadcast:
  enabled: true
  targets: ["127.0.0.1:9000"]
  scenes: [intro, drop]
keyboards:
  - group: hall
    keyboard: 1
bindings:
  - key: t
    action:
      type: tap
  - key: 44
    action:
      type: toggle_effect
      name: red
      group: bar
      effect:
        kind: solid
        color: red
  - keyboard: 1
    key: s
    action:
      type: toggle_effect
      name: hall strobe
      effect:
        kind: strobe
        color: "#ffffff"
        rate: 4
  - key: up
    action:
      type: nudge
      bpm: 2.5
  - key: b
    action:
      type: strip_strobe
      strip: bar top
      width: 12
poll_interval: 2ms
initial_bpm: 128
"##;

    const MINIMAL: &str = r#"
bus:
  port: /dev/ttyUSB0
"#;

    #[test]
    fn test_full_config() {
        let settings = Settings::from_yaml(FULL).unwrap();

        let bus = settings.bus();
        assert_eq!(bus.port(), "/dev/ttyUSB0");
        assert_eq!(bus.baud(), 57600);
        assert_eq!(bus.frame_delay().unwrap(), Duration::from_millis(1));
        assert_eq!(bus.broadcast_address(), 0x7fff);
        assert_eq!(bus.tick_divisor(), Some(30));
        assert!(!bus.dry_run());

        assert_eq!(settings.strips().len(), 1);
        assert_eq!(settings.strips()[0].address(), 2);
        assert_eq!(settings.strips()[0].flags(), 16);
        assert_eq!(settings.strips()[0].baud(), 115200);
        assert_eq!(settings.strip_tick_divisor(), Some(60));

        let groups = settings.group_addresses();
        assert_eq!(groups["bar"], vec![3, 4]);
        assert_eq!(groups["hall"], vec![0x30]);
        assert_eq!(settings.groups()[0].devices()[0].label(), "Bar left");
        assert_eq!(settings.groups()[0].devices()[1].label(), "0x0004");

        assert_eq!(settings.calibration()[&3], [255, 102, 102, 255]);

        let broadcast = settings.broadcast().unwrap();
        assert!(broadcast.enabled());
        assert_eq!(broadcast.targets().unwrap().len(), 1);
        assert_eq!(broadcast.sub_beat_divisor(), 30);
        assert_eq!(broadcast.scenes(), vec!["intro", "drop"]);

        assert_eq!(settings.keyboard_groups(1), vec!["hall"]);
        assert!(settings.keyboard_groups(0).is_empty());

        let bindings = settings.bindings().unwrap();
        assert_eq!(bindings[&0].len(), 4);
        assert_eq!(bindings[&0][0].action, Action::Tap);
        assert_eq!(bindings[&0][1].key, 44);
        assert_eq!(
            bindings[&0][1].action,
            Action::ToggleEffect {
                name: "red".to_string(),
                effect: EffectKind::Solid { color: Color::RED },
                group: Some("bar".to_string()),
            }
        );
        assert_eq!(bindings[&0][2].action, Action::Nudge { bpm: 2.5 });
        assert_eq!(
            bindings[&0][3].action,
            Action::StripStrobe {
                strip: "bar top".to_string(),
                color: Color::WHITE,
                width: 12,
            }
        );
        assert_eq!(
            bindings[&1][0].action,
            Action::ToggleEffect {
                name: "hall strobe".to_string(),
                effect: EffectKind::Strobe {
                    color: Color::WHITE,
                    rate: 4,
                    width: 24,
                },
                group: None,
            }
        );

        assert_eq!(settings.poll_interval().unwrap(), Duration::from_millis(2));
        assert_eq!(settings.initial_bpm(), 128.0);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();
        assert_eq!(settings.bus().baud(), 115200);
        assert_eq!(settings.bus().broadcast_address(), 0);
        assert_eq!(settings.bus().tick_divisor(), None);
        assert!(settings.broadcast().is_none());
        assert_eq!(settings.poll_interval().unwrap(), Duration::from_millis(1));
        assert_eq!(settings.initial_bpm(), 120.0);

        // The master layout, without the group toggle.
        let bindings = settings.bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[&0].len(), 6);
    }

    #[test]
    fn test_default_layout_toggles_first_group() {
        let yaml = format!(
            "{}groups:\n  - name: bar\n    devices:\n      - address: 3\n",
            MINIMAL
        );
        let settings = Settings::from_yaml(&yaml).unwrap();
        let bindings = settings.bindings().unwrap();
        assert_eq!(bindings[&0].len(), 7);
        assert!(matches!(
            &bindings[&0][6].action,
            Action::ToggleEffect { group: Some(group), .. } if group == "bar"
        ));
    }

    fn invalid(extra: &str) -> String {
        match Settings::from_yaml(&format!("{}{}", MINIMAL, extra)) {
            Err(ConfigError::Invalid(reason)) => reason,
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("config should not load"),
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(invalid("initial_bpm: 900\n").contains("BPM"));
        assert!(invalid("calibration:\n  - address: 1\n    rgba: [1, 2, 0, 0]\n")
            .contains("calibration"));
        assert!(invalid(
            "bindings:\n  - key: r\n    action:\n      type: reset_group\n      group: nowhere\n"
        )
        .contains("nowhere"));
        assert!(invalid("bindings:\n  - key: hyper\n    action:\n      type: tap\n")
            .contains("hyper"));
        assert!(invalid(
            "bindings:\n  - key: c\n    action:\n      type: toggle_effect\n      name: c\n      effect:\n        kind: flash_cycle\n        colors: []\n"
        )
        .contains("flash cycle"));
        assert!(invalid("bindings:\n  - key: e\n    action:\n      type: quantize\n      nearest: 0\n")
            .contains("quantize"));
        assert!(invalid("keyboards:\n  - group: nowhere\n    keyboard: 1\n").contains("nowhere"));
        assert!(invalid(
            "bindings:\n  - key: s\n    action:\n      type: strip_strobe\n      strip: nowhere\n"
        )
        .contains("nowhere"));
    }

    #[test]
    fn test_rejects_effect_rates_the_firmware_cannot_render() {
        let rate = |kind: &str, rate: u32| {
            format!(
                "bindings:\n  - key: p\n    action:\n      type: toggle_effect\n      name: p\n      effect:\n        kind: {}\n        color: red\n        rate: {}\n",
                kind, rate
            )
        };
        assert!(invalid(&rate("pulse", 250)).contains("rate"));
        assert!(invalid(&rate("strobe", 241)).contains("rate"));
        assert!(invalid(&rate("swipe", 0)).contains("rate"));
        assert!(Settings::from_yaml(&format!("{}{}", MINIMAL, rate("pulse", 240))).is_ok());
    }

    #[test]
    fn test_rejects_bad_durations() {
        assert!(matches!(
            Settings::from_yaml(&format!("{}poll_interval: soon\n", MINIMAL)),
            Err(ConfigError::Duration(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_effect_kind() {
        let yaml = format!(
            "{}bindings:\n  - key: x\n    action:\n      type: toggle_effect\n      name: x\n      effect:\n        kind: laser\n",
            MINIMAL
        );
        assert!(matches!(
            Settings::from_yaml(&yaml),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.bus().baud(), 57600);

        assert!(matches!(
            Settings::load(&file.path().with_extension("missing.yaml")),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let mut env = Map::new();
        env.insert(
            "CURSEDLIGHT_BUS__PORT".to_string(),
            "/dev/ttyS9".to_string(),
        );
        env.insert("CURSEDLIGHT_BUS__DRY_RUN".to_string(), "true".to_string());
        env.insert("CURSEDLIGHT_INITIAL_BPM".to_string(), "90".to_string());

        let settings = Settings::build(
            File::from_str(MINIMAL, config::FileFormat::Yaml),
            Some(env),
        )
        .unwrap();
        assert_eq!(settings.bus().port(), "/dev/ttyS9");
        assert!(settings.bus().dry_run());
        assert_eq!(settings.initial_bpm(), 90.0);
    }
}
