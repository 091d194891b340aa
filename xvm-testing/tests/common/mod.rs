//! A toy machine driving the test engine end to end.
//!
//! Programs are made of `func Name() {` blocks closed by a `}` line. Every
//! line of a body is one statement:
//!
//! ```text
//! println("text")    write a line of output
//! panic("msg")       unhandled panic
//! throw("msg")       panic with a typed value
//! crash("msg")       panic of the host
//! emit("Type")       emit an event
//! store("k", "v")    write to the realm store
//! alloc(n)           allocate n bytes
//! leak()             leave a value on the stack
//! call Name          call another function
//! t.Fail() t.Skip()  report from a unit test
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use xvm_testing::coverage::BlockIndex;
use xvm_testing::profile::ProfileLocation;
use xvm_testing::test_cache::sha256_hex;
use xvm_testing::vm::{Exception, SharedBuffer, UnitReport};
use xvm_testing::{Machine, MachineFactory, MachineOptions, MemFile, MemPackage, PackageInfo, PackageStore};

#[derive(Debug, Clone)]
struct Func {
    name: String,
    file: String,
    line: u32,
    body: Vec<(u32, String)>,
    block: Option<BlockIndex>,
}

fn parse_funcs(file: &str, source: &str) -> Vec<Func> {
    let mut funcs = Vec::new();
    let mut current: Option<Func> = None;
    for (idx, line) in source.lines().enumerate() {
        let line_no = idx as u32 + 1;
        if let Some(func) = current.as_mut() {
            if line == "}" {
                funcs.extend(current.take());
            } else if !line.trim().is_empty() {
                func.body.push((line_no, line.trim().to_string()));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("func ") {
            let name = rest.split('(').next().unwrap_or_default().trim();
            current = Some(Func {
                name: name.to_string(),
                file: file.to_string(),
                line: line_no,
                body: Vec::new(),
                block: None,
            });
        }
    }
    funcs
}

fn string_args(stmt: &str) -> Vec<String> {
    stmt.split('"')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

fn is_test_file(name: &str) -> bool {
    name.ends_with("_test.x") || name.ends_with("_filetest.x")
}

pub struct ToyMachine {
    opts: MachineOptions,
    committed: Arc<Mutex<HashMap<String, Vec<MemFile>>>>,
    funcs: HashMap<String, Func>,
    preprocessed: HashMap<String, String>,
    stack: Vec<ProfileLocation>,
    exception_frames: Vec<String>,
    store_ops: Vec<String>,
    events: Vec<serde_json::Value>,
    debug: bool,
    leaked: usize,
    cycles: i64,
    allocated: i64,
    failed: bool,
    skipped: bool,
}

impl ToyMachine {
    fn define(&mut self, files: &[MemFile], covered: bool) {
        for file in files {
            for mut func in parse_funcs(&file.name, &file.body) {
                if covered && !is_test_file(&file.name) {
                    if let Some(coverage) = &self.opts.coverage {
                        let end = func.body.last().map_or(func.line, |(l, _)| l + 1);
                        func.block = Some(coverage.add_block(
                            &file.name,
                            func.line,
                            1,
                            end,
                            2,
                            func.body.len() as u32,
                        ));
                    }
                }
                self.funcs.insert(func.name.clone(), func);
            }
        }
    }

    fn call(&mut self, name: &str) -> Result<(), Exception> {
        let func = self
            .funcs
            .get(name)
            .cloned()
            .ok_or_else(|| Exception::Preprocess(format!("name {name} not declared")))?;
        if let (Some(coverage), Some(block)) = (&self.opts.coverage, func.block) {
            coverage
                .increment_block(block)
                .map_err(|e| Exception::Other(e.to_string()))?;
        }
        self.stack.push(ProfileLocation {
            function: func.name.clone(),
            file: func.file.clone(),
            line: func.line,
        });
        for (line, stmt) in &func.body {
            if let Some(top) = self.stack.last_mut() {
                top.line = *line;
            }
            self.exec(stmt)?;
        }
        self.stack.pop();
        Ok(())
    }

    fn exec(&mut self, stmt: &str) -> Result<(), Exception> {
        self.cycles += 1;
        if let Some(sink) = &self.opts.profile_sink {
            sink.record_sample(&self.stack, 1, 0);
            if let Some(top) = self.stack.last() {
                sink.record_line(&top.function, &top.file, top.line, 1, 0);
            }
        }
        let args = string_args(stmt);
        let first = args.first().cloned().unwrap_or_default();

        if stmt.starts_with("println(") {
            let mut out = self.opts.output.clone();
            let _ = writeln!(out, "{first}");
        } else if stmt.starts_with("panic(") {
            self.exception_frames = self.frames();
            return Err(Exception::Unhandled(format!("unhandled panic: {first}")));
        } else if stmt.starts_with("throw(") {
            return Err(Exception::Value(format!("{first} (string)")));
        } else if stmt.starts_with("crash(") {
            panic!("{first}");
        } else if stmt.starts_with("emit(") {
            self.events.push(json!({
                "type": first,
                "pkg_path": self.opts.context.pkg_path,
            }));
        } else if stmt.starts_with("store(") {
            let value = args.get(1).cloned().unwrap_or_default();
            self.store_ops.push(format!("u[{}:{first}]={value}", self.opts.context.pkg_path));
        } else if let Some(rest) = stmt.strip_prefix("alloc(") {
            let bytes: i64 = rest.trim_end_matches(')').parse().unwrap_or(0);
            self.allocated += bytes;
            if let Some(sink) = &self.opts.profile_sink {
                sink.record_alloc(&self.stack, bytes, 1);
            }
            let max = self.opts.max_alloc_bytes;
            if max > 0 && self.allocated > max {
                return Err(Exception::Other("allocation limit exceeded".to_string()));
            }
        } else if stmt == "leak()" {
            self.leaked += 1;
        } else if let Some(name) = stmt.strip_prefix("call ") {
            self.call(name.trim())?;
        } else if stmt == "t.Fail()" {
            self.failed = true;
        } else if stmt == "t.Skip()" {
            self.skipped = true;
        } else {
            return Err(Exception::Preprocess(format!("unknown statement: {stmt}")));
        }
        Ok(())
    }

    fn frames(&self) -> Vec<String> {
        self.stack
            .iter()
            .rev()
            .map(|loc| format!("{}()\n    {}:{}", loc.function, loc.file, loc.line))
            .collect()
    }
}

impl Machine for ToyMachine {
    fn run_files(
        &mut self,
        _pkg_name: &str,
        pkg_path: &str,
        filename: &str,
        source: &str,
    ) -> Result<(), Exception> {
        let files = [MemFile::new(filename, source)];
        self.define(&files, true);
        let dump: Vec<String> = parse_funcs(filename, source)
            .iter()
            .map(|f| {
                let body: Vec<&str> = f.body.iter().map(|(_, s)| s.as_str()).collect();
                format!("func {}() {{ {} }}", f.name, body.join("; "))
            })
            .collect();
        self.preprocessed.insert(pkg_path.to_string(), dump.join("\n"));
        Ok(())
    }

    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    fn run_package_committed(&mut self, pkg: &MemPackage) -> Result<(), Exception> {
        self.define(&pkg.files, true);
        if self.funcs.contains_key("init") {
            self.call("init")?;
        }
        self.committed
            .lock()
            .map_err(|e| Exception::Other(e.to_string()))?
            .insert(pkg.path.clone(), pkg.files.clone());
        Ok(())
    }

    fn activate_package(&mut self, pkg_path: &str) -> Result<(), Exception> {
        let files = self
            .committed
            .lock()
            .map_err(|e| Exception::Other(e.to_string()))?
            .get(pkg_path)
            .cloned()
            .ok_or_else(|| Exception::Other(format!("package {pkg_path} was not committed")))?;
        let blocks: HashMap<String, Option<BlockIndex>> =
            self.funcs.iter().map(|(n, f)| (n.clone(), f.block)).collect();
        self.funcs.clear();
        self.define(&files, false);
        for func in self.funcs.values_mut() {
            func.block = blocks.get(&func.name).copied().flatten();
        }
        Ok(())
    }

    fn reset_store_ops(&mut self) {
        self.store_ops.clear();
    }

    fn call_main(&mut self) -> Result<(), Exception> {
        self.call("main")
    }

    fn load_package(&mut self, pkg: &MemPackage, test_files: &[MemFile]) -> Result<(), Exception> {
        let sources: Vec<MemFile> = pkg
            .files
            .iter()
            .filter(|f| !is_test_file(&f.name))
            .cloned()
            .collect();
        self.define(&sources, true);
        self.define(test_files, false);
        Ok(())
    }

    fn run_unit_test(
        &mut self,
        name: &str,
        _run_flag: &str,
        _verbose: bool,
    ) -> Result<UnitReport, Exception> {
        self.failed = false;
        self.skipped = false;
        self.events.clear();
        self.call(name)?;
        Ok(UnitReport {
            failed: self.failed,
            skipped: self.skipped,
        })
    }

    fn check_empty(&self) -> Result<(), String> {
        if self.leaked == 0 {
            Ok(())
        } else {
            Err(format!("{} value(s) left on the stack", self.leaked))
        }
    }

    fn store_ops(&self) -> String {
        self.store_ops.join("\n")
    }

    fn events(&self) -> serde_json::Value {
        if self.events.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::Array(self.events.clone())
        }
    }

    fn preprocessed(&self, pkg_path: &str) -> Option<String> {
        self.preprocessed.get(pkg_path).cloned()
    }

    fn stacktrace(&self) -> String {
        self.frames().iter().map(|f| format!("{f}\n")).collect()
    }

    fn exceptions_stacktrace(&self) -> String {
        self.exception_frames.iter().map(|f| format!("{f}\n")).collect()
    }

    fn cycles(&self) -> i64 {
        self.cycles
    }

    fn alloc_status(&self) -> Option<(i64, i64)> {
        (self.opts.max_alloc_bytes > 0).then_some((self.opts.max_alloc_bytes, self.allocated))
    }
}

#[derive(Default)]
pub struct ToyFactory {
    committed: Arc<Mutex<HashMap<String, Vec<MemFile>>>>,
    created: AtomicUsize,
}

impl ToyFactory {
    pub fn machines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl MachineFactory for ToyFactory {
    fn new_machine(&self, opts: MachineOptions) -> Box<dyn Machine> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ToyMachine {
            opts,
            committed: Arc::clone(&self.committed),
            funcs: HashMap::new(),
            preprocessed: HashMap::new(),
            stack: Vec::new(),
            exception_frames: Vec::new(),
            store_ops: Vec::new(),
            events: Vec::new(),
            debug: true,
            leaked: 0,
            cycles: 0,
            allocated: 0,
            failed: false,
            skipped: false,
        })
    }
}

/// Packages available for import, with mutable content hashes.
#[derive(Default)]
pub struct ToyStore {
    packages: RwLock<HashMap<String, PackageInfo>>,
    sources: RwLock<HashMap<(String, String), String>>,
}

impl ToyStore {
    pub fn with_packages(paths: &[&str]) -> Self {
        let store = Self::default();
        for path in paths {
            store.set_package(path, &format!("{path} v1"));
        }
        store
    }

    /// Adds or replaces the package at `path`, whose single file holds `body`.
    pub fn set_package(&self, path: &str, body: &str) {
        let hash = sha256_hex(body.as_bytes());
        let info = PackageInfo {
            content_hash: hash.clone(),
            path: path.to_string(),
            files: BTreeMap::from([("pkg.x".to_string(), hash)]),
        };
        self.packages
            .write()
            .unwrap()
            .insert(path.to_string(), info);
        self.sources
            .write()
            .unwrap()
            .insert((path.to_string(), "pkg.x".to_string()), body.to_string());
    }
}

impl PackageStore for ToyStore {
    fn load_package(&self, pkg_path: &str) -> bool {
        self.packages.read().unwrap().contains_key(pkg_path)
    }

    fn package_info(&self, pkg_path: &str) -> Option<PackageInfo> {
        self.packages.read().unwrap().get(pkg_path).cloned()
    }

    fn read_file(&self, pkg_path: &str, file: &str) -> Option<String> {
        self.sources
            .read()
            .unwrap()
            .get(&(pkg_path.to_string(), file.to_string()))
            .cloned()
    }
}

pub fn shared(store: ToyStore, factory: ToyFactory) -> (Arc<ToyStore>, Arc<ToyFactory>) {
    (Arc::new(store), Arc::new(factory))
}

/// Test output buffer usable as a boxed writer.
pub fn buffer() -> SharedBuffer {
    SharedBuffer::new()
}
