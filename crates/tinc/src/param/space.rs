// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter spaces.
//!
//! A [`ParameterSpace`] groups parameters whose candidate spaces span
//! a multidimensional grid, maps grid points to filesystem paths
//! through a token template, sweeps the grid, and runs cached
//! computations against the current point.

use crate::cache::{
    CacheEntry, CacheManager, FileDependency, SourceArgument, SourceInfo, SourceType, UserInfo,
};
use crate::error::TincError;
use crate::param::value::{ParamValue, SpaceRepresentation};
use crate::param::{validate_identifier, ParamRef};
use crate::protocol::wire::{
    ConfigureObject, ConfigureParameterSpace, RegisterObject, RegisterParameterSpace, SpaceUpdate,
};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to a parameter space.
pub type SpaceRef = Arc<parking_lot::Mutex<ParameterSpace>>;

/// A named computation with its declared parameter arguments.
///
/// The argument names select which member parameters the function
/// sees; they also key the cache, so two functions with the same name
/// and arguments share results.
pub struct ProcessFunction {
    name: String,
    arg_names: Vec<String>,
    f: Arc<
        dyn Fn(&HashMap<String, ParamValue>) -> Result<serde_json::Value, TincError>
            + Send
            + Sync,
    >,
}

impl ProcessFunction {
    pub fn new<F>(name: impl Into<String>, arg_names: Vec<String>, f: F) -> Self
    where
        F: Fn(&HashMap<String, ParamValue>) -> Result<serde_json::Value, TincError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            arg_names,
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Options for [`ParameterSpace::sweep`].
pub struct SweepSettings {
    /// Ids of the member parameters to sweep. Empty sweeps all of
    /// them.
    pub params: Vec<String>,
    /// Recorded as cache dependencies for every point.
    pub dependencies: Vec<ParamRef>,
    /// Recompute every point even when a cached result exists.
    pub force_recompute: bool,
    /// Set each swept parameter to its tuple value, which emits its
    /// CONFIGURE(VALUE) and fires callbacks; originals are restored
    /// afterwards. When false the parameters never move and the tuple
    /// reaches the function through its arguments only.
    pub force_values: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            dependencies: Vec::new(),
            force_recompute: false,
            force_values: true,
        }
    }
}

/// A grouping of parameters with path templating, sweeps and cached
/// computation.
pub struct ParameterSpace {
    id: String,
    root_path: String,
    path_template: String,
    parameters: Vec<ParamRef>,
    outbound: Option<Outbound>,
    sweeping: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    process_lock: Arc<parking_lot::Mutex<()>>,
    cache: Option<Arc<CacheManager>>,
}

impl ParameterSpace {
    pub fn new(id: impl Into<String>) -> Result<Self, TincError> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self {
            id,
            root_path: String::new(),
            path_template: String::new(),
            parameters: Vec::new(),
            outbound: None,
            sweeping: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            process_lock: Arc::new(parking_lot::Mutex::new(())),
            cache: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn path_template(&self) -> &str {
        &self.path_template
    }

    pub fn attach(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Enable computation caching in `dir`.
    pub fn enable_cache(&mut self, dir: impl Into<std::path::PathBuf>) -> Result<(), TincError> {
        self.cache = Some(Arc::new(CacheManager::new(dir)?));
        Ok(())
    }

    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a parameter. Re-adding the same id is a no-op.
    pub fn add_parameter(&mut self, param: ParamRef) {
        let (id, address) = {
            let p = param.lock();
            (p.id().to_string(), p.full_address())
        };
        if self.parameters.iter().any(|p| p.lock().id() == id) {
            debug!(space = %self.id, parameter = %id, "already a member");
            return;
        }
        self.parameters.push(param);
        self.emit_update(SpaceUpdate::AddParameter { address });
    }

    pub fn remove_parameter(&mut self, id: &str) {
        let before = self.parameters.len();
        self.parameters.retain(|p| p.lock().id() != id);
        if self.parameters.len() != before {
            self.emit_update(SpaceUpdate::RemoveParameter {
                address: id.to_string(),
            });
        }
    }

    pub fn parameters(&self) -> &[ParamRef] {
        &self.parameters
    }

    pub fn get_parameter(&self, id: &str) -> Option<ParamRef> {
        self.parameters
            .iter()
            .find(|p| p.lock().id() == id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    pub fn set_root_path(&mut self, path: impl Into<String>) {
        self.root_path = path.into();
        let update = SpaceUpdate::RootPath {
            path: self.root_path.clone(),
        };
        self.emit_update(update);
    }

    pub fn set_path_template(&mut self, template: impl Into<String>) {
        self.path_template = template.into();
        let update = SpaceUpdate::PathTemplate {
            template: self.path_template.clone(),
        };
        self.emit_update(update);
    }

    /// Apply one CONFIGURE field from a peer (paths only; membership
    /// changes resolve against the registry, not here).
    pub fn apply_update(&mut self, update: &SpaceUpdate) {
        match update {
            SpaceUpdate::RootPath { path } => self.root_path = path.clone(),
            SpaceUpdate::PathTemplate { template } => self.path_template = template.clone(),
            SpaceUpdate::AddParameter { .. } | SpaceUpdate::RemoveParameter { .. } => {}
        }
    }

    /// Resolve `template` against the current point.
    ///
    /// Tokens are `%%name%%` or `%%name:MODE%%` with MODE one of
    /// VALUE, INDEX, ID; without a mode the parameter's own space
    /// representation applies. A token naming no member parameter is
    /// left in place verbatim.
    pub fn resolve_template(&self, template: &str) -> String {
        self.resolve_template_with(template, &HashMap::new())
    }

    /// Like [`ParameterSpace::resolve_template`] but with some
    /// parameters pinned to a candidate index instead of their current
    /// value. Slicing resolves sibling grid points this way without
    /// moving the live parameters.
    pub fn resolve_template_with(
        &self,
        template: &str,
        pinned: &HashMap<String, usize>,
    ) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find("%%") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("%%") else {
                // Unterminated token, keep the tail as-is.
                out.push_str(&rest[start..]);
                return out;
            };
            let token = &after[..end];
            match self.render_token(token, pinned) {
                Some(rendered) => out.push_str(&rendered),
                None => {
                    warn!(space = %self.id, token, "unresolved path template token");
                    out.push_str("%%");
                    out.push_str(token);
                    out.push_str("%%");
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn render_token(&self, token: &str, pinned: &HashMap<String, usize>) -> Option<String> {
        let (name, explicit_mode) = match token.split_once(':') {
            Some((name, mode)) => (name, SpaceRepresentation::from_name(mode)),
            None => (token, None),
        };
        let param = self.get_parameter(name)?;
        let p = param.lock();
        let mode = explicit_mode.unwrap_or_else(|| p.space_representation());
        p.render_at(mode, pinned.get(name).copied())
    }

    /// Does the path template mention `name`? Parameters that do are
    /// filesystem dimensions: moving them selects another directory.
    pub fn is_filesystem_dimension(&self, name: &str) -> bool {
        self.path_template.contains(&format!("%%{}%%", name))
            || self.path_template.contains(&format!("%%{}:", name))
    }

    /// Template resolved at the current point.
    pub fn current_relative_path(&self) -> String {
        self.resolve_template(&self.path_template)
    }

    /// Root path joined with the current relative path.
    pub fn current_path(&self) -> String {
        join_paths(&self.root_path, &self.current_relative_path())
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Request cancellation of a running sweep. The sweep stops after
    /// the point being processed.
    pub fn request_sweep_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::SeqCst)
    }

    /// Visit every point of the swept grid in row-major order with the
    /// first parameter varying fastest, running `func` through
    /// [`ParameterSpace::run_process`] at each tuple so results land
    /// in the cache when one is attached. With `force_values` the
    /// swept parameters are set at each point and their original
    /// values are restored afterwards, even on error or cancellation.
    ///
    /// A second sweep while one is running returns
    /// [`TincError::SweepInProgress`].
    pub fn sweep(&self, func: &ProcessFunction, settings: &SweepSettings) -> Result<(), TincError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TincError::SweepInProgress);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let swept = match self.swept_parameters(&settings.params) {
            Ok(swept) => swept,
            Err(e) => {
                self.sweeping.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let originals: Vec<ParamValue> =
            swept.iter().map(|p| p.lock().value().clone()).collect();

        let result = self.sweep_inner(func, &swept, settings);

        if settings.force_values {
            // Other peers see the forced values while the sweep runs;
            // the restore below is what puts the grid back.
            for (param, original) in swept.iter().zip(originals) {
                if let Err(e) = param.lock().set_value(original) {
                    warn!(space = %self.id, "failed to restore value after sweep: {}", e);
                }
            }
        }
        self.sweeping.store(false, Ordering::SeqCst);
        result
    }

    fn swept_parameters(&self, ids: &[String]) -> Result<Vec<ParamRef>, TincError> {
        if ids.is_empty() {
            return Ok(self.parameters.clone());
        }
        ids.iter()
            .map(|id| {
                self.get_parameter(id).ok_or_else(|| {
                    TincError::Validation(format!(
                        "sweep parameter {:?} is not a member of {}",
                        id, self.id
                    ))
                })
            })
            .collect()
    }

    fn sweep_inner(
        &self,
        func: &ProcessFunction,
        swept: &[ParamRef],
        settings: &SweepSettings,
    ) -> Result<(), TincError> {
        // Odometer over candidate counts; a parameter without a space
        // contributes a single point at its current value.
        let dims: Vec<usize> = swept
            .iter()
            .map(|p| p.lock().space_values().len().max(1))
            .collect();
        let mut indices = vec![0usize; dims.len()];

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                debug!(space = %self.id, "sweep cancelled");
                return Ok(());
            }

            let mut args = HashMap::new();
            for (param, &i) in swept.iter().zip(&indices) {
                let p = param.lock();
                let value = p
                    .space_values()
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| p.value().clone());
                args.insert(p.id().to_string(), value);
            }
            if settings.force_values {
                for (param, &i) in swept.iter().zip(&indices) {
                    let mut p = param.lock();
                    if !p.space_values().is_empty() {
                        p.set_at(i)?;
                    }
                }
            }
            self.run_process(func, &args, &settings.dependencies, settings.force_recompute)?;

            // First parameter advances fastest.
            let mut done = true;
            for (pos, dim) in dims.iter().enumerate() {
                indices[pos] += 1;
                if indices[pos] < *dim {
                    done = false;
                    break;
                }
                indices[pos] = 0;
            }
            if done {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Cached computation
    // ------------------------------------------------------------------

    /// Run `func` with `args` against the current point. Results are
    /// served from the cache when an entry with an identical source
    /// description exists, unless `force_recompute` is set. The value
    /// of each parameter in `dependencies` is recorded in the source
    /// description and keys the cache alongside the arguments.
    /// Computations on the same space serialize.
    ///
    /// Arguments not declared by `func` are dropped with a warning; a
    /// declared argument that is not supplied takes the current value
    /// of the member parameter of the same id.
    pub fn run_process(
        &self,
        func: &ProcessFunction,
        args: &HashMap<String, ParamValue>,
        dependencies: &[ParamRef],
        force_recompute: bool,
    ) -> Result<serde_json::Value, TincError> {
        let _guard = self.process_lock.lock();

        let mut projected = HashMap::new();
        for (name, value) in args {
            if func.arg_names.iter().any(|a| a == name) {
                projected.insert(name.clone(), value.clone());
            } else {
                warn!(
                    space = %self.id,
                    process = %func.name,
                    argument = %name,
                    "dropping argument not declared by the process function"
                );
            }
        }
        for name in &func.arg_names {
            if projected.contains_key(name) {
                continue;
            }
            let param = self.get_parameter(name).ok_or_else(|| {
                TincError::Validation(format!(
                    "process argument {:?} is neither supplied nor a member of {}",
                    name, self.id
                ))
            })?;
            projected.insert(name.clone(), param.lock().value().clone());
        }
        let args = projected;

        let source = self.source_info(func, &args, dependencies);

        if !force_recompute {
            if let Some(cache) = &self.cache {
                if let Some(files) = cache.find_cache(&source) {
                    if let Some(first) = files.first() {
                        debug!(space = %self.id, process = %func.name, file = %first, "cache hit");
                        let bytes = cache.read_file(first)?;
                        return Ok(serde_json::from_slice(&bytes)?);
                    }
                }
            }
        }

        let started = Utc::now();
        let value = (func.f)(&args)?;

        if let Some(cache) = &self.cache {
            let filename = format!("{}_{:016x}.json", func.name, source_digest(&source));
            cache.write_file(&filename, &serde_json::to_vec(&value)?)?;
            cache.append_entry(CacheEntry {
                timestamp_start: started,
                timestamp_end: Utc::now(),
                files: vec![filename],
                user_info: UserInfo::capture(),
                source_info: source,
                cache_hits: 0,
                stale: false,
            })?;
        }
        Ok(value)
    }

    fn source_info(
        &self,
        func: &ProcessFunction,
        args: &HashMap<String, ParamValue>,
        dependencies: &[ParamRef],
    ) -> SourceInfo {
        let mut arguments: Vec<SourceArgument> = args
            .iter()
            .map(|(id, v)| SourceArgument {
                id: id.clone(),
                value: v.into(),
            })
            .collect();
        arguments.sort_by(|a, b| a.id.cmp(&b.id));

        let mut deps: Vec<SourceArgument> = dependencies
            .iter()
            .map(|param| {
                let p = param.lock();
                SourceArgument {
                    id: p.id().to_string(),
                    value: p.value().into(),
                }
            })
            .collect();
        deps.sort_by(|a, b| a.id.cmp(&b.id));

        // Advisory; recorded for provenance, not part of matching.
        let file_dependencies = std::env::current_dir()
            .ok()
            .and_then(|cwd| FileDependency::capture(&cwd).ok())
            .into_iter()
            .collect();

        SourceInfo {
            source_type: SourceType::ProcessFunction,
            tinc_id: self.id.clone(),
            command_line_arguments: func.name.clone(),
            working_path: self.current_relative_path(),
            arguments,
            dependencies: deps,
            file_dependencies,
        }
    }

    // ------------------------------------------------------------------
    // Wire integration
    // ------------------------------------------------------------------

    pub fn to_register(&self) -> RegisterObject {
        RegisterObject::ParameterSpace(RegisterParameterSpace {
            id: self.id.clone(),
        })
    }

    fn emit_update(&self, update: SpaceUpdate) {
        if let Some(tx) = &self.outbound {
            let env = Envelope::new(
                MessageType::Configure,
                ObjectType::ParameterSpace,
                Details::Configure(ConfigureObject::ParameterSpace(ConfigureParameterSpace {
                    id: self.id.clone(),
                    update,
                })),
            );
            if tx.send(env).is_err() {
                warn!(space = %self.id, "peer channel closed, dropping configure");
            }
        }
    }
}

/// Join a root and a relative path with exactly one separator.
pub fn join_paths(root: &str, relative: &str) -> String {
    if root.is_empty() {
        return relative.to_string();
    }
    if relative.is_empty() {
        return root.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), relative.trim_start_matches('/'))
}

fn source_digest(source: &SourceInfo) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.tinc_id.hash(&mut hasher);
    source.command_line_arguments.hash(&mut hasher);
    for arg in source.arguments.iter().chain(&source.dependencies) {
        arg.id.hash(&mut hasher);
        arg.value.data_type.hash(&mut hasher);
        if let Ok(json) = serde_json::to_string(&arg.value) {
            json.hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Parameter;

    fn param_with_space(id: &str, values: &[f32]) -> ParamRef {
        let mut p = Parameter::new(id, ParamValue::Float(values[0])).unwrap();
        p.set_values(values.iter().map(|v| ParamValue::Float(*v)).collect())
            .unwrap();
        Arc::new(parking_lot::Mutex::new(p))
    }

    fn two_param_space() -> ParameterSpace {
        let mut ps = ParameterSpace::new("grid").unwrap();
        ps.add_parameter(param_with_space("alpha", &[0.0, 1.0]));
        ps.add_parameter(param_with_space("beta", &[10.0, 20.0, 30.0]));
        ps
    }

    #[test]
    fn test_membership_idempotent() {
        let mut ps = ParameterSpace::new("ps").unwrap();
        let p = param_with_space("x", &[1.0]);
        ps.add_parameter(Arc::clone(&p));
        ps.add_parameter(p);
        assert_eq!(ps.parameters().len(), 1);

        ps.remove_parameter("x");
        assert!(ps.parameters().is_empty());
    }

    #[test]
    fn test_resolve_template_modes() {
        let mut ps = ParameterSpace::new("ps").unwrap();
        let p = param_with_space("temp", &[271.0, 272.0, 273.0]);
        {
            let mut guard = p.lock();
            guard
                .set_ids(vec!["cold".into(), "mild".into(), "warm".into()])
                .unwrap();
            guard.set_at(1).unwrap();
        }
        ps.add_parameter(p);

        assert_eq!(ps.resolve_template("run_%%temp%%"), "run_272");
        assert_eq!(ps.resolve_template("run_%%temp:INDEX%%"), "run_1");
        assert_eq!(ps.resolve_template("run_%%temp:ID%%"), "run_mild");
    }

    #[test]
    fn test_resolve_template_unknown_token_left_verbatim() {
        let ps = ParameterSpace::new("ps").unwrap();
        assert_eq!(ps.resolve_template("a/%%ghost%%/b"), "a/%%ghost%%/b");
        // Unterminated token passes through too.
        assert_eq!(ps.resolve_template("a/%%open"), "a/%%open");
    }

    #[test]
    fn test_template_uses_default_representation() {
        let mut ps = ParameterSpace::new("ps").unwrap();
        let p = param_with_space("n", &[5.0, 6.0]);
        {
            let mut guard = p.lock();
            guard.apply_space_representation(SpaceRepresentation::Index);
            guard.set_at(1).unwrap();
        }
        ps.add_parameter(p);
        assert_eq!(ps.resolve_template("%%n%%"), "1");
        assert_eq!(ps.resolve_template("%%n:VALUE%%"), "6");
    }

    #[test]
    fn test_current_path_joins_root() {
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.set_root_path("/data/runs/");
        ps.set_path_template("case_%%x%%");
        let p = param_with_space("x", &[3.0]);
        ps.add_parameter(p);
        assert_eq!(ps.current_path(), "/data/runs/case_3");
    }

    fn noop_func() -> ProcessFunction {
        ProcessFunction::new("noop", vec![], |_| Ok(serde_json::json!(null)))
    }

    /// Pushes each visited (alpha, beta) tuple into `seen`.
    fn recording_func(seen: &Arc<parking_lot::Mutex<Vec<(f64, f64)>>>) -> ProcessFunction {
        let sink = Arc::clone(seen);
        ProcessFunction::new(
            "record",
            vec!["alpha".into(), "beta".into()],
            move |args| {
                sink.lock().push((
                    args["alpha"].as_f64().unwrap_or(f64::NAN),
                    args["beta"].as_f64().unwrap_or(f64::NAN),
                ));
                Ok(serde_json::json!(null))
            },
        )
    }

    #[test]
    fn test_sweep_row_major_first_param_fastest() {
        let ps = two_param_space();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        ps.sweep(&recording_func(&seen), &SweepSettings::default())
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 6);
        // alpha cycles fastest.
        assert_eq!(seen[0], (0.0, 10.0));
        assert_eq!(seen[1], (1.0, 10.0));
        assert_eq!(seen[2], (0.0, 20.0));
        assert_eq!(seen[5], (1.0, 30.0));
    }

    #[test]
    fn test_sweep_restores_values() {
        let ps = two_param_space();
        ps.get_parameter("alpha").unwrap().lock().set_at(1).unwrap();
        ps.get_parameter("beta").unwrap().lock().set_at(2).unwrap();

        ps.sweep(&noop_func(), &SweepSettings::default()).unwrap();

        assert_eq!(
            *ps.get_parameter("alpha").unwrap().lock().value(),
            ParamValue::Float(1.0)
        );
        assert_eq!(
            *ps.get_parameter("beta").unwrap().lock().value(),
            ParamValue::Float(30.0)
        );
    }

    #[test]
    fn test_sweep_without_force_values_leaves_parameters() {
        let ps = two_param_space();
        ps.get_parameter("alpha").unwrap().lock().set_at(1).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        ps.sweep(
            &recording_func(&seen),
            &SweepSettings {
                force_values: false,
                ..SweepSettings::default()
            },
        )
        .unwrap();

        // The tuple still reaches the function through its arguments.
        assert_eq!(seen.lock().len(), 6);
        assert_eq!(seen.lock()[0], (0.0, 10.0));
        // The live parameter never moved.
        assert_eq!(
            *ps.get_parameter("alpha").unwrap().lock().value(),
            ParamValue::Float(1.0)
        );
    }

    #[test]
    fn test_sweep_params_subset() {
        let ps = two_param_space();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        ps.sweep(
            &recording_func(&seen),
            &SweepSettings {
                params: vec!["alpha".to_string()],
                ..SweepSettings::default()
            },
        )
        .unwrap();

        // beta is not swept; its current value fills the argument.
        let seen = seen.lock();
        assert_eq!(*seen, vec![(0.0, 10.0), (1.0, 10.0)]);
    }

    #[test]
    fn test_sweep_unknown_param_rejected() {
        let ps = two_param_space();
        let settings = SweepSettings {
            params: vec!["ghost".to_string()],
            ..SweepSettings::default()
        };
        assert!(matches!(
            ps.sweep(&noop_func(), &settings),
            Err(TincError::Validation(_))
        ));
        assert!(!ps.is_sweeping());
    }

    #[test]
    fn test_sweep_cancel_stops_early() {
        let ps = two_param_space();
        let visited = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = Arc::clone(&visited);
        let cancel = Arc::clone(&ps.cancel);
        let func = ProcessFunction::new("count", vec![], move |_| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                cancel.store(true, Ordering::SeqCst);
            }
            Ok(serde_json::json!(null))
        });
        ps.sweep(&func, &SweepSettings::default()).unwrap();
        assert_eq!(visited.load(Ordering::SeqCst), 2);
        assert!(!ps.is_sweeping());
    }

    #[test]
    fn test_sweep_reentrancy_rejected() {
        let ps = two_param_space();
        ps.sweeping.store(true, Ordering::SeqCst);
        assert!(matches!(
            ps.sweep(&noop_func(), &SweepSettings::default()),
            Err(TincError::SweepInProgress)
        ));
        ps.sweeping.store(false, Ordering::SeqCst);
        ps.sweep(&noop_func(), &SweepSettings::default()).unwrap();
    }

    #[test]
    fn test_sweep_error_restores_and_unlocks() {
        let ps = two_param_space();
        let func =
            ProcessFunction::new("boom", vec![], |_| Err(TincError::Validation("boom".into())));
        let err = ps.sweep(&func, &SweepSettings::default());
        assert!(err.is_err());
        assert!(!ps.is_sweeping());
        // A new sweep is possible afterwards.
        ps.sweep(&noop_func(), &SweepSettings::default()).unwrap();
    }

    #[test]
    fn test_sweep_memoizes_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut ps = ParameterSpace::new("grid").unwrap();
        ps.enable_cache(dir.path()).unwrap();
        ps.add_parameter(param_with_space("x", &[1.0, 2.0]));

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let func = ProcessFunction::new("f", vec!["x".into()], move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(args["x"].as_f64()))
        });

        ps.sweep(&func, &SweepSettings::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // A second pass over the same grid is served from the cache.
        ps.sweep(&func, &SweepSettings::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_process_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.enable_cache(dir.path()).unwrap();
        ps.add_parameter(param_with_space("x", &[1.0, 2.0, 3.0]));

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let func = ProcessFunction::new("double", vec!["x".into()], move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let x = args["x"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(x * 2.0))
        });

        let no_args = HashMap::new();
        let first = ps.run_process(&func, &no_args, &[], false).unwrap();
        let second = ps.run_process(&func, &no_args, &[], false).unwrap();
        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Moving the point invalidates the lookup.
        ps.get_parameter("x").unwrap().lock().set_at(2).unwrap();
        let third = ps.run_process(&func, &no_args, &[], false).unwrap();
        assert_eq!(third, serde_json::json!(6.0));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_process_force_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.enable_cache(dir.path()).unwrap();
        ps.add_parameter(param_with_space("x", &[1.0]));

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let func = ProcessFunction::new("f", vec!["x".into()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(1))
        });

        let no_args = HashMap::new();
        ps.run_process(&func, &no_args, &[], false).unwrap();
        ps.run_process(&func, &no_args, &[], true).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_process_missing_argument() {
        // Declared but neither supplied nor resolvable from a member.
        let ps = ParameterSpace::new("ps").unwrap();
        let func = ProcessFunction::new("f", vec!["absent".into()], |_| Ok(serde_json::json!(0)));
        assert!(matches!(
            ps.run_process(&func, &HashMap::new(), &[], false),
            Err(TincError::Validation(_))
        ));
    }

    #[test]
    fn test_run_process_drops_undeclared_arguments() {
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.add_parameter(param_with_space("x", &[1.0]));
        let func = ProcessFunction::new("f", vec!["x".into()], |args| {
            assert!(!args.contains_key("stray"));
            Ok(serde_json::json!(args.len()))
        });

        let mut args = HashMap::new();
        args.insert("stray".to_string(), ParamValue::Float(9.0));
        let out = ps.run_process(&func, &args, &[], false).unwrap();
        assert_eq!(out, serde_json::json!(1));
    }

    #[test]
    fn test_run_process_dependencies_key_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.enable_cache(dir.path()).unwrap();
        ps.add_parameter(param_with_space("x", &[1.0]));
        let dep = param_with_space("seed", &[1.0, 2.0]);

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let func = ProcessFunction::new("f", vec!["x".into()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(0))
        });

        let no_args = HashMap::new();
        let deps = [Arc::clone(&dep)];
        ps.run_process(&func, &no_args, &deps, false).unwrap();
        ps.run_process(&func, &no_args, &deps, false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // A moved dependency misses the cache even though the
        // arguments are unchanged.
        dep.lock().set_at(1).unwrap();
        ps.run_process(&func, &no_args, &deps, false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_process_records_working_directory_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let mut ps = ParameterSpace::new("ps").unwrap();
        ps.enable_cache(dir.path()).unwrap();
        ps.add_parameter(param_with_space("x", &[1.0]));
        let func = ProcessFunction::new("f", vec!["x".into()], |_| Ok(serde_json::json!(0)));

        ps.run_process(&func, &HashMap::new(), &[], false).unwrap();

        let entries = ps.cache().unwrap().entries();
        assert_eq!(entries.len(), 1);
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            entries[0].source_info.file_dependencies[0].file,
            cwd.to_string_lossy()
        );
    }

    #[test]
    fn test_run_process_without_cache_always_computes() {
        let ps = {
            let mut ps = ParameterSpace::new("ps").unwrap();
            ps.add_parameter(param_with_space("x", &[1.0]));
            ps
        };
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let func = ProcessFunction::new("f", vec!["x".into()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(0))
        });
        let no_args = HashMap::new();
        ps.run_process(&func, &no_args, &[], false).unwrap();
        ps.run_process(&func, &no_args, &[], false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/a/b/", "c"), "/a/b/c");
        assert_eq!(join_paths("/a/b", "/c"), "/a/b/c");
        assert_eq!(join_paths("", "c"), "c");
        assert_eq!(join_paths("/a", ""), "/a");
    }
}
