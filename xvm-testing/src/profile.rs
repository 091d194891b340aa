//! Profiling across test runs
//!
//! A [`ProfileConfig`] is started once, shared with every machine of every
//! package tested afterwards through its [`ProfileSink`], and stopped once. The
//! collected [`Profile`] is then handed to a [`ProfileWriter`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TestError};
use crate::vm::PackageStore;

const ROUTINE_SEPARATOR: &str = "ROUTINE ========================";
const TOP_FUNCTIONS: usize = 20;

/// What is being measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    #[default]
    Cpu,
    Memory,
    Gas,
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProfileType::Cpu => "CPU",
            ProfileType::Memory => "Memory",
            ProfileType::Gas => "Gas",
        })
    }
}

/// How a profile is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileFormat {
    #[default]
    Text,
    Json,
    /// Only the top functions table
    TopList,
}

/// A position in the program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileLocation {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// Aggregated figures of a single function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStat {
    pub name: String,
    /// Samples taken while this function was the innermost frame
    pub samples: i64,
    pub total_cycles: i64,
    pub self_cycles: i64,
    pub total_gas: i64,
    pub self_gas: i64,
    pub alloc_bytes: i64,
    pub alloc_objects: i64,
}

/// Figures of a single source line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStat {
    pub count: i64,
    pub cycles: i64,
    pub gas: i64,
}

/// Line figures of one function, by file then line.
pub type FunctionLines = BTreeMap<String, BTreeMap<u32, LineStat>>;

/// The result of a profiling session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(rename = "type")]
    pub kind: ProfileType,
    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub total_cycles: i64,
    pub total_gas: i64,
    /// Sorted by decreasing cost for `kind`
    pub functions: Vec<FunctionStat>,
    #[serde(skip)]
    pub function_lines: BTreeMap<String, FunctionLines>,
}

impl Profile {
    /// Writes the human readable report: a short header and the top functions.
    pub fn write_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Profile Type: {}", self.kind)?;
        writeln!(
            w,
            "Duration: {:?}",
            std::time::Duration::from_nanos(self.duration_nanos.max(0) as u64)
        )?;
        writeln!(w, "Functions Tracked: {}", self.functions.len())?;
        writeln!(w)?;
        self.write_top_functions(w)
    }

    pub fn write_top_functions(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let (title, flat_label, cum_label) = match self.kind {
            ProfileType::Cpu => ("CPU Cycles", "Flat", "Cum"),
            ProfileType::Gas => ("Gas", "Flat Gas", "Cum Gas"),
            ProfileType::Memory => ("Memory Allocations", "Bytes", "Objects"),
        };
        let (flat_pct, cum_pct) = match self.kind {
            ProfileType::Memory => ("Bytes%", "Obj%"),
            _ => ("Flat%", "Cum%"),
        };
        let (flat_total, cum_total) = match self.kind {
            ProfileType::Cpu => (self.total_cycles, self.total_cycles),
            ProfileType::Gas => (self.total_gas, self.total_gas),
            ProfileType::Memory => (
                self.functions.iter().map(|f| f.alloc_bytes).sum(),
                self.functions.iter().map(|f| f.alloc_objects).sum(),
            ),
        };

        writeln!(w, "Top Functions ({title}):")?;
        writeln!(
            w,
            "{:<50} {:>12} {:>12} {:>12} {:>12}",
            "Function", flat_label, flat_pct, cum_label, cum_pct
        )?;
        writeln!(w, "{}", "-".repeat(100))?;
        for stat in self.functions.iter().take(TOP_FUNCTIONS) {
            let (flat, cum) = match self.kind {
                ProfileType::Cpu => (stat.self_cycles, stat.total_cycles),
                ProfileType::Gas => (stat.self_gas, stat.total_gas),
                ProfileType::Memory => (stat.alloc_bytes, stat.alloc_objects),
            };
            writeln!(
                w,
                "{:<50} {:>12} {:>11.2}% {:>12} {:>11.2}%",
                shorten_name(&stat.name, 50),
                flat,
                percent(flat, flat_total),
                cum,
                percent(cum, cum_total)
            )?;
        }
        writeln!(w)
    }

    pub fn write_json(&self, w: &mut dyn Write) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TestError::profile(format!("encoding profile: {e}")))?;
        writeln!(w, "{json}").map_err(|e| TestError::profile(e.to_string()))
    }

    /// Writes a per-line listing of every function whose name contains
    /// `func_name`, with source lines taken from `store` when available.
    pub fn write_function_list(
        &self,
        w: &mut dyn Write,
        func_name: &str,
        store: &dyn PackageStore,
    ) -> std::io::Result<()> {
        if self.kind == ProfileType::Memory {
            return writeln!(
                w,
                "Line-level listings are not available for memory profiles."
            );
        }

        let matched: Vec<(&String, &FunctionLines)> = self
            .function_lines
            .iter()
            .filter(|(name, _)| name.contains(func_name))
            .collect();
        if matched.is_empty() {
            return writeln!(w, "No samples found for function: {func_name}");
        }

        let total: i64 = matched
            .iter()
            .flat_map(|(_, files)| files.values())
            .flat_map(|lines| lines.values())
            .map(|s| self.line_cost(s))
            .sum();

        for (i, (name, files)) in matched.iter().enumerate() {
            if i > 0 {
                writeln!(w)?;
            }
            for (file, lines) in files.iter() {
                let cost: i64 = lines.values().map(|s| self.line_cost(s)).sum();
                writeln!(w, "{ROUTINE_SEPARATOR} {name} in {file}")?;
                writeln!(
                    w,
                    "{cost:>10} {cost:>10} (flat, cum) {:.2}% of Total",
                    percent(cost, total)
                )?;

                let source = split_file_path(file).and_then(|(pkg, f)| store.read_file(pkg, f));
                match source {
                    Some(source) => self.write_source_lines(w, &source, lines)?,
                    None => {
                        for (line, stat) in lines {
                            writeln!(w, "{:>10} {line:>6}: <source unavailable>", self.line_cost(stat))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_source_lines(
        &self,
        w: &mut dyn Write,
        source: &str,
        lines: &BTreeMap<u32, LineStat>,
    ) -> std::io::Result<()> {
        let (Some(first), Some(last)) = (lines.keys().next(), lines.keys().next_back()) else {
            return Ok(());
        };
        for (idx, text) in source.lines().enumerate() {
            let line = idx as u32 + 1;
            if line < *first || line > *last {
                continue;
            }
            match lines.get(&line) {
                Some(stat) => writeln!(w, "{:>10} {line:>6}: {text}", self.line_cost(stat))?,
                None => writeln!(w, "{:>10} {line:>6}: {text}", ".")?,
            }
        }
        Ok(())
    }

    fn line_cost(&self, stat: &LineStat) -> i64 {
        match self.kind {
            ProfileType::Gas => stat.gas,
            _ => stat.cycles,
        }
    }
}

fn percent(value: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    value as f64 / total as f64 * 100.0
}

fn shorten_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        return name.to_string();
    }
    let head: String = name.chars().take(max_len - 3).collect();
    format!("{head}...")
}

/// `"x.land/p/demo/avl/tree.x"` into `("x.land/p/demo/avl", "tree.x")`
fn split_file_path(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

/// Instrumentation hooks called by machines while they run.
pub trait ProfileSink: Send + Sync {
    /// A sample of `stack` (outermost call first) costing `cycles` and `gas`.
    fn record_sample(&self, stack: &[ProfileLocation], cycles: i64, gas: i64);

    fn record_alloc(&self, stack: &[ProfileLocation], bytes: i64, objects: i64);

    /// Cost attributed to a single line; only kept with line-level profiling.
    fn record_line(&self, function: &str, file: &str, line: u32, cycles: i64, gas: i64);
}

/// An active capture.
pub trait Profiler: Send {
    fn sink(&self) -> Arc<dyn ProfileSink>;

    /// Ends the capture and returns everything recorded.
    fn stop(&mut self) -> Profile;
}

/// What a profiler is asked to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileOptions {
    pub kind: ProfileType,
    pub line_level: bool,
}

/// Creates profilers.
pub trait ProfilerBackend {
    fn start(&self, opts: ProfileOptions) -> Result<Box<dyn Profiler>>;
}

/// Renders a finished profile.
pub trait ProfileWriter {
    fn write_profile(
        &self,
        profile: &Profile,
        config: &ProfileConfig,
        out: &mut dyn Write,
        store: &dyn PackageStore,
    ) -> Result<()>;
}

#[derive(Default)]
enum ProfileState {
    #[default]
    Idle,
    Running {
        profiler: Box<dyn Profiler>,
        sink: Arc<dyn ProfileSink>,
    },
}

/// Profiling settings and the session they drive.
#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: ProfileType,
    pub format: ProfileFormat,
    pub output_file: Option<PathBuf>,
    pub print_to_stdout: bool,
    /// Comma-separated function names to list line by line
    pub function_list: Option<String>,
    #[serde(skip)]
    state: ProfileState,
}

impl fmt::Debug for ProfileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConfig")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("output_file", &self.output_file)
            .field("print_to_stdout", &self.print_to_stdout)
            .field("function_list", &self.function_list)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProfileConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ProfileState::Running { .. })
    }

    pub fn line_level(&self) -> bool {
        self.function_list.as_deref().is_some_and(|f| !f.is_empty())
    }

    /// Starts a session. Returns false, leaving the running profiler in place,
    /// when one is already active.
    pub fn start(&mut self, backend: &dyn ProfilerBackend) -> Result<bool> {
        if self.is_running() {
            debug!("profiler already running");
            return Ok(false);
        }
        let profiler = backend.start(ProfileOptions {
            kind: self.kind,
            line_level: self.line_level(),
        })?;
        let sink = profiler.sink();
        self.state = ProfileState::Running { profiler, sink };
        info!(kind = %self.kind, "profiling started");
        Ok(true)
    }

    /// The sink machines report to, while running.
    pub fn sink(&self) -> Option<Arc<dyn ProfileSink>> {
        match &self.state {
            ProfileState::Running { sink, .. } => Some(Arc::clone(sink)),
            ProfileState::Idle => None,
        }
    }

    /// Ends the session and hands the profile to `writer`. Does nothing when
    /// idle.
    pub fn stop(
        &mut self,
        out: &mut dyn Write,
        store: &dyn PackageStore,
        writer: &dyn ProfileWriter,
    ) -> Result<()> {
        let ProfileState::Running { mut profiler, .. } = std::mem::take(&mut self.state) else {
            return Ok(());
        };
        let profile = profiler.stop();
        info!(functions = profile.functions.len(), "profiling stopped");
        writer.write_profile(&profile, self, out, store)
    }
}

/// Writes the profile to `out` or to the configured file, followed by the
/// requested function listings.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProfileWriter;

impl DefaultProfileWriter {
    fn render(profile: &Profile, format: ProfileFormat, w: &mut dyn Write) -> Result<()> {
        match format {
            ProfileFormat::Json => profile.write_json(w),
            ProfileFormat::Text => profile
                .write_text(w)
                .map_err(|e| TestError::profile(e.to_string())),
            ProfileFormat::TopList => profile
                .write_top_functions(w)
                .map_err(|e| TestError::profile(e.to_string())),
        }
    }
}

impl ProfileWriter for DefaultProfileWriter {
    fn write_profile(
        &self,
        profile: &Profile,
        config: &ProfileConfig,
        out: &mut dyn Write,
        store: &dyn PackageStore,
    ) -> Result<()> {
        match (&config.output_file, config.print_to_stdout) {
            (Some(path), false) => {
                let mut buf = Vec::new();
                Self::render(profile, config.format, &mut buf)?;
                fs::write(path, buf).map_err(|e| TestError::io(path, e))?;
                writeln!(out, "profile written to {}", path.display())
                    .map_err(|e| TestError::profile(e.to_string()))?;
            }
            _ => Self::render(profile, config.format, out)?,
        }

        if let Some(list) = &config.function_list {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                profile
                    .write_function_list(out, name, store)
                    .map_err(|e| TestError::profile(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Collected {
    functions: HashMap<String, FunctionStat>,
    lines: BTreeMap<String, FunctionLines>,
    total_cycles: i64,
    total_gas: i64,
}

/// Aggregates samples in memory.
struct StatsSink {
    line_level: bool,
    collected: Mutex<Collected>,
}

impl ProfileSink for StatsSink {
    fn record_sample(&self, stack: &[ProfileLocation], cycles: i64, gas: i64) {
        let Some(leaf) = stack.last() else {
            return;
        };
        let mut c = self.collected.lock().unwrap_or_else(PoisonError::into_inner);
        c.total_cycles += cycles;
        c.total_gas += gas;

        // Recursive frames are only charged once.
        let mut seen = HashSet::new();
        for loc in stack {
            if !seen.insert(loc.function.as_str()) {
                continue;
            }
            let stat = function_stat(&mut c.functions, &loc.function);
            stat.total_cycles += cycles;
            stat.total_gas += gas;
        }
        let stat = function_stat(&mut c.functions, &leaf.function);
        stat.self_cycles += cycles;
        stat.self_gas += gas;
        stat.samples += 1;
    }

    fn record_alloc(&self, stack: &[ProfileLocation], bytes: i64, objects: i64) {
        let Some(leaf) = stack.last() else {
            return;
        };
        let mut c = self.collected.lock().unwrap_or_else(PoisonError::into_inner);
        let stat = function_stat(&mut c.functions, &leaf.function);
        stat.alloc_bytes += bytes;
        stat.alloc_objects += objects;
    }

    fn record_line(&self, function: &str, file: &str, line: u32, cycles: i64, gas: i64) {
        if !self.line_level {
            return;
        }
        let mut c = self.collected.lock().unwrap_or_else(PoisonError::into_inner);
        let stat = c
            .lines
            .entry(function.to_string())
            .or_default()
            .entry(file.to_string())
            .or_default()
            .entry(line)
            .or_default();
        stat.count += 1;
        stat.cycles += cycles;
        stat.gas += gas;
    }
}

fn function_stat<'a>(functions: &'a mut HashMap<String, FunctionStat>, name: &str) -> &'a mut FunctionStat {
    functions
        .entry(name.to_string())
        .or_insert_with(|| FunctionStat {
            name: name.to_string(),
            ..FunctionStat::default()
        })
}

/// An in-process profiler fed by [`ProfileSink`] calls.
pub struct StatsProfiler {
    kind: ProfileType,
    started: Instant,
    time_nanos: i64,
    sink: Arc<StatsSink>,
}

impl Profiler for StatsProfiler {
    fn sink(&self) -> Arc<dyn ProfileSink> {
        self.sink.clone()
    }

    fn stop(&mut self) -> Profile {
        let collected = std::mem::take(
            &mut *self
                .sink
                .collected
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut functions: Vec<FunctionStat> = collected.functions.into_values().collect();
        let kind = self.kind;
        functions.sort_by(|a, b| {
            let key = |f: &FunctionStat| match kind {
                ProfileType::Cpu => f.self_cycles,
                ProfileType::Gas => f.self_gas,
                ProfileType::Memory => f.alloc_bytes,
            };
            key(b).cmp(&key(a)).then_with(|| a.name.cmp(&b.name))
        });

        Profile {
            kind,
            time_nanos: self.time_nanos,
            duration_nanos: self.started.elapsed().as_nanos() as i64,
            total_cycles: collected.total_cycles,
            total_gas: collected.total_gas,
            functions,
            function_lines: collected.lines,
        }
    }
}

/// Backend creating [`StatsProfiler`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsBackend;

impl ProfilerBackend for StatsBackend {
    fn start(&self, opts: ProfileOptions) -> Result<Box<dyn Profiler>> {
        Ok(Box::new(StatsProfiler {
            kind: opts.kind,
            started: Instant::now(),
            time_nanos: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            sink: Arc::new(StatsSink {
                line_level: opts.line_level,
                collected: Mutex::new(Collected::default()),
            }),
        }))
    }
}
