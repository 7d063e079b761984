use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::SamplerError;
use crate::table::SlotId;

const MAX_DRAW_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Choice(Vec<String>),
    Integer { min: i64, max: i64 },
    Number { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub id: String,
    pub aliases: Vec<String>,
    pub kind: ParamKind,
}

impl ParamSpec {
    fn choice(id: &str, options: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            aliases: Vec::new(),
            kind: ParamKind::Choice(options.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn integer(id: &str, min: i64, max: i64) -> Self {
        Self {
            id: id.to_string(),
            aliases: Vec::new(),
            kind: ParamKind::Integer { min, max },
        }
    }

    fn number(id: &str, min: f64, max: f64) -> Self {
        Self {
            id: id.to_string(),
            aliases: Vec::new(),
            kind: ParamKind::Number { min, max },
        }
    }

    fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    fn draw(&self, rng: &mut StdRng) -> String {
        match &self.kind {
            ParamKind::Choice(options) => options[rng.gen_range(0..options.len())].clone(),
            ParamKind::Integer { min, max } => rng.gen_range(*min..=*max).to_string(),
            ParamKind::Number { min, max } if min < max => {
                format!("{:.6}", rng.gen_range(*min..*max))
            }
            ParamKind::Number { min, .. } => format!("{:.6}", min),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    pub params: Vec<ParamSpec>,
}

impl SearchSpace {
    pub fn z3_sat() -> Self {
        let max = i64::from(u32::MAX);
        Self {
            params: vec![
                ParamSpec::choice(
                    "sat.phase",
                    &["always_false", "always_true", "basic_caching", "random", "caching"],
                ),
                ParamSpec::choice("sat.restart", &["static", "luby", "ema", "geometric"]),
                ParamSpec::choice("sat.branching.heuristic", &["vsids", "chb"]),
                ParamSpec::choice("sat.branching.anti_exploration", &["true", "false"]),
                ParamSpec::choice("sat.enable_pre_simplify", &["true", "false"]),
                ParamSpec::integer("sat.search.unsat.conflicts", 400, max)
                    .with_alias("sat.search.sat.conflicts"),
                ParamSpec::integer("sat.rephase.base", 1000, max),
                ParamSpec::integer("sat.reorder.base", 1000, max),
                ParamSpec::integer("sat.reorder.activity_scale", 100, max),
                ParamSpec::integer("sat.restart.initial", 0, 100),
                ParamSpec::integer("sat.variable_decay", 100, max),
                ParamSpec::integer("sat.random_seed", 0, max),
                ParamSpec::integer("sat.burst_search", 100, max),
                ParamSpec::integer("sat.simplify.delay", 0, max),
                ParamSpec::integer("sat.backtrack.scopes", 100, max),
                ParamSpec::integer("sat.backtrack.conflicts", 2000, max),
                ParamSpec::number("sat.restart.factor", 1.5, 10.0),
                ParamSpec::number("sat.restart.margin", 1.1, 10.0),
                ParamSpec::number("sat.restart.emafastglue", 0.03, 1.0),
                ParamSpec::number("sat.restart.emaslowglue", 0.00001, 1.0),
                ParamSpec::number("sat.random_freq", 0.00001, 0.99),
            ],
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading search space {}", path.display()))?;
        let file: SearchSpaceFile = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => serde_json::from_str(&data)?,
        };
        if file.schema_version != "search_space_v1" {
            return Err(anyhow!(
                "unsupported search space schema_version: {}",
                file.schema_version
            ));
        }
        if file.params.is_empty() {
            return Err(anyhow!("search space {} has no params", path.display()));
        }
        let params = file
            .params
            .into_iter()
            .map(ParamDef::into_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { params })
    }

    pub fn render(&self, rng: &mut StdRng) -> String {
        let mut tokens = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let value = param.draw(rng);
            tokens.push(format!("{}={}", param.id, value));
            for alias in &param.aliases {
                tokens.push(format!("{}={}", alias, value));
            }
        }
        tokens.join(" ")
    }
}

#[derive(Debug, Deserialize)]
struct SearchSpaceFile {
    schema_version: String,
    params: Vec<ParamDef>,
}

#[derive(Debug, Deserialize)]
struct ParamDef {
    id: String,
    #[serde(rename = "type")]
    value_type: String,
    #[serde(default)]
    options: Option<Vec<Value>>,
    #[serde(default)]
    minimum: Option<f64>,
    #[serde(default)]
    maximum: Option<f64>,
    #[serde(default)]
    alias: Vec<String>,
}

impl ParamDef {
    fn into_spec(self) -> Result<ParamSpec> {
        if self.id.trim().is_empty() || self.id.contains(char::is_whitespace) {
            return Err(anyhow!("param id '{}' must be a single token", self.id));
        }
        let kind = match self.value_type.as_str() {
            "choice" => {
                let options = self
                    .options
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| anyhow!("choice param {} needs options", self.id))?;
                let rendered = options
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>();
                if rendered.iter().any(|s| s.is_empty() || s.contains(char::is_whitespace)) {
                    return Err(anyhow!("choice param {} has a blank or spaced option", self.id));
                }
                ParamKind::Choice(rendered)
            }
            "integer" => {
                let (min, max) = self.bounds()?;
                ParamKind::Integer {
                    min: min as i64,
                    max: max as i64,
                }
            }
            "number" => {
                let (min, max) = self.bounds()?;
                ParamKind::Number { min, max }
            }
            other => {
                return Err(anyhow!(
                    "param {} has unknown type '{}': expected choice|integer|number",
                    self.id,
                    other
                ))
            }
        };
        Ok(ParamSpec {
            id: self.id,
            aliases: self.alias,
            kind,
        })
    }

    fn bounds(&self) -> Result<(f64, f64)> {
        let min = self
            .minimum
            .ok_or_else(|| anyhow!("param {} is missing minimum", self.id))?;
        let max = self
            .maximum
            .ok_or_else(|| anyhow!("param {} is missing maximum", self.id))?;
        // rand cannot sample a span that overflows to infinity.
        if !(max - min).is_finite() || min > max {
            return Err(anyhow!(
                "param {} has invalid range [{}, {}]",
                self.id,
                min,
                max
            ));
        }
        Ok((min, max))
    }
}

#[derive(Debug)]
pub struct Generator {
    space: SearchSpace,
    rng: StdRng,
    issued: HashSet<String>,
}

impl Generator {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            space,
            rng,
            issued: HashSet::new(),
        }
    }

    pub fn sample(&mut self) -> Result<String, SamplerError> {
        for _ in 0..MAX_DRAW_ATTEMPTS {
            let candidate = self.space.render(&mut self.rng);
            if self.issued.insert(candidate.clone()) {
                return Ok(candidate);
            }
            debug!("configuration collision, redrawing");
        }
        Err(SamplerError::Saturated(MAX_DRAW_ATTEMPTS))
    }
}

#[derive(Debug, Default)]
pub struct Replayer {
    queues: BTreeMap<SlotId, VecDeque<String>>,
}

impl Replayer {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading configuration log {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut queues: BTreeMap<SlotId, VecDeque<String>> = BTreeMap::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (slot, configuration) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("line {}: expected <slot_id>:<configuration>", idx + 1))?;
            let slot = slot
                .trim()
                .parse::<SlotId>()
                .map_err(|_| anyhow!("line {}: slot id '{}' is not an integer", idx + 1, slot))?;
            queues
                .entry(slot)
                .or_default()
                .push_back(configuration.to_string());
        }
        Ok(Self { queues })
    }

    pub fn replay(&mut self, slot: SlotId) -> Result<String, SamplerError> {
        self.queues
            .get_mut(&slot)
            .and_then(VecDeque::pop_front)
            .ok_or(SamplerError::ExhaustedReplay(slot))
    }

    pub fn remaining(&self, slot: SlotId) -> usize {
        self.queues.get(&slot).map_or(0, VecDeque::len)
    }
}

#[derive(Debug)]
pub struct ConfigLog {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ConfigLog {
    pub fn create(path: &Path) -> Result<Self, SamplerError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| SamplerError::Log {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, slot: SlotId, configuration: &str) -> Result<(), SamplerError> {
        writeln!(self.out, "{}:{}", slot, configuration)
            .and_then(|_| self.out.flush())
            .map_err(|source| SamplerError::Log {
                path: self.path.display().to_string(),
                source,
            })
    }
}

#[derive(Debug)]
pub enum ConfigSampler {
    Generate {
        generator: Generator,
        log: Option<ConfigLog>,
    },
    Replay(Replayer),
}

impl ConfigSampler {
    pub fn generating(
        space: SearchSpace,
        seed: Option<u64>,
        log_path: Option<&Path>,
    ) -> Result<Self, SamplerError> {
        let log = log_path.map(ConfigLog::create).transpose()?;
        if let Some(path) = log_path {
            info!(path = %path.display(), "recording configurations");
        }
        Ok(ConfigSampler::Generate {
            generator: Generator::new(space, seed),
            log,
        })
    }

    pub fn replaying(log_path: &Path) -> Result<Self> {
        let replayer = Replayer::load(log_path)?;
        info!(path = %log_path.display(), slots = replayer.queues.len(), "replaying configurations");
        Ok(ConfigSampler::Replay(replayer))
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, ConfigSampler::Replay(_))
    }

    pub fn next_for(&mut self, slot: SlotId) -> Result<String, SamplerError> {
        match self {
            ConfigSampler::Generate { generator, log } => {
                let configuration = generator.sample()?;
                if let Some(log) = log.as_mut() {
                    log.append(slot, &configuration)?;
                }
                Ok(configuration)
            }
            ConfigSampler::Replay(replayer) => replayer.replay(slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z3_space_renders_every_option_once() {
        let space = SearchSpace::z3_sat();
        let mut rng = StdRng::seed_from_u64(7);
        let rendered = space.render(&mut rng);
        let tokens: Vec<&str> = rendered.split(' ').collect();
        assert_eq!(tokens.len(), space.params.len() + 1);
        assert!(tokens.iter().all(|t| t.contains('=')));
        assert!(rendered.starts_with("sat.phase="));

        let value_of = |name: &str| {
            tokens
                .iter()
                .find_map(|t| t.strip_prefix(&format!("{name}=")))
                .expect("token present")
        };
        assert_eq!(
            value_of("sat.search.unsat.conflicts"),
            value_of("sat.search.sat.conflicts")
        );
        let initial: i64 = value_of("sat.restart.initial").parse().expect("int");
        assert!((0..=100).contains(&initial));
        let factor = value_of("sat.restart.factor");
        assert_eq!(factor.split('.').nth(1).map(str::len), Some(6));
    }

    #[test]
    fn seeded_generators_agree() {
        let mut a = Generator::new(SearchSpace::z3_sat(), Some(42));
        let mut b = Generator::new(SearchSpace::z3_sat(), Some(42));
        for _ in 0..5 {
            assert_eq!(a.sample().expect("a"), b.sample().expect("b"));
        }
    }

    #[test]
    fn generator_never_repeats_and_saturates_on_tiny_space() {
        let space = SearchSpace {
            params: vec![ParamSpec::choice("x", &["a", "b"])],
        };
        let mut generator = Generator::new(space, Some(1));
        let first = generator.sample().expect("first");
        let second = generator.sample().expect("second");
        assert_ne!(first, second);
        assert!(matches!(
            generator.sample(),
            Err(SamplerError::Saturated(_))
        ));
    }

    #[test]
    fn replay_hands_out_per_slot_lines_in_order() {
        let mut replayer =
            Replayer::parse("0:a=1 b=2\n1:a=3\n0:a=4 url=x:y\n\n").expect("parse");
        assert_eq!(replayer.remaining(0), 2);
        assert_eq!(replayer.replay(0).expect("0#1"), "a=1 b=2");
        assert_eq!(replayer.replay(1).expect("1#1"), "a=3");
        assert_eq!(replayer.replay(0).expect("0#2"), "a=4 url=x:y");
        assert!(matches!(
            replayer.replay(0),
            Err(SamplerError::ExhaustedReplay(0))
        ));
        assert!(matches!(
            replayer.replay(9),
            Err(SamplerError::ExhaustedReplay(9))
        ));
    }

    #[test]
    fn replay_rejects_malformed_lines() {
        assert!(Replayer::parse("no separator").is_err());
        assert!(Replayer::parse("x:a=1").is_err());
    }

    #[test]
    fn generated_log_replays_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("params.log");
        let mut generated: BTreeMap<SlotId, Vec<String>> = BTreeMap::new();
        {
            let mut sampler =
                ConfigSampler::generating(SearchSpace::z3_sat(), Some(3), Some(&log_path))
                    .expect("sampler");
            for slot in [0, 1, 2, 0, 2, 0] {
                let cfg = sampler.next_for(slot).expect("sample");
                generated.entry(slot).or_default().push(cfg);
            }
        }

        let mut replay = ConfigSampler::replaying(&log_path).expect("replay");
        assert!(replay.is_replay());
        for (slot, configs) in &generated {
            for cfg in configs {
                assert_eq!(&replay.next_for(*slot).expect("replayed"), cfg);
            }
            assert!(replay.next_for(*slot).is_err());
        }
    }

    #[test]
    fn loads_yaml_and_json_spaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = dir.path().join("space.yaml");
        fs::write(
            &yaml,
            "schema_version: search_space_v1\nparams:\n  - id: seed\n    type: integer\n    minimum: 1\n    maximum: 3\n    alias: [smt.random_seed]\n  - id: mode\n    type: choice\n    options: [fast, 2, true]\n",
        )
        .expect("write yaml");
        let space = SearchSpace::load(&yaml).expect("yaml space");
        assert_eq!(space.params.len(), 2);
        assert_eq!(space.params[0].aliases, vec!["smt.random_seed".to_string()]);
        assert_eq!(
            space.params[1].kind,
            ParamKind::Choice(vec!["fast".into(), "2".into(), "true".into()])
        );

        let json = dir.path().join("space.json");
        fs::write(
            &json,
            r#"{"schema_version":"search_space_v1","params":[{"id":"f","type":"number","minimum":2.0,"maximum":1.0}]}"#,
        )
        .expect("write json");
        let err = SearchSpace::load(&json).expect_err("inverted range");
        assert!(err.to_string().contains("invalid range"), "{}", err);
    }

    #[test]
    fn rejects_real_ranges_too_wide_to_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json = dir.path().join("space.json");
        fs::write(
            &json,
            r#"{"schema_version":"search_space_v1","params":[{"id":"f","type":"number","minimum":-1e308,"maximum":1e308}]}"#,
        )
        .expect("write json");
        let err = SearchSpace::load(&json).expect_err("span overflows");
        assert!(err.to_string().contains("invalid range"), "{}", err);

        fs::write(
            &json,
            r#"{"schema_version":"search_space_v1","params":[{"id":"f","type":"number","minimum":-1e307,"maximum":1e307}]}"#,
        )
        .expect("write json");
        let space = SearchSpace::load(&json).expect("wide but finite span");
        let mut sampler = ConfigSampler::generating(space, Some(5), None).expect("sampler");
        assert!(sampler.next_for(0).expect("draw").starts_with("f="));
    }
}
