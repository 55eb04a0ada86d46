use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::artifact::{CompiledScript, ScriptHeader};
use crate::dsl::ast::SourcePos;
use crate::dsl::error::CompileError;
use crate::dsl::{self, source_map::SourceMap};
use crate::error::LoadError;
use crate::fs::{FileSystem, OsFileSystem};
use crate::parser::{JsonAstParser, ScriptParser};
use crate::paths;
use crate::runtime::{self, PassthroughRuntime, RuntimeCompileError, ScriptRuntime};
use crate::settings::CompilerSettings;

use super::flyweight::{Abandon, Completion, FlyweightCache, LoadHandle};
use super::signature::{ScriptKind, Signature};

/// Handle to a compile that may still be running.
pub type ScriptHandle = LoadHandle<CompiledScript, LoadError>;

impl Abandon<Signature> for LoadError {
    fn abandoned(key: &Signature) -> Self {
        LoadError::Abandoned { path: key.path.clone() }
    }
}

struct Inner {
    cache: FlyweightCache<Signature, CompiledScript, LoadError>,
    parser: Arc<dyn ScriptParser>,
    runtime: Arc<dyn ScriptRuntime>,
    fs: Arc<dyn FileSystem>,
    settings: CompilerSettings,
    compiles: AtomicUsize,
    next_script_id: AtomicU64,
}

/// Compiled-script cache keyed by [`Signature`]. Cheap to clone; clones share
/// the same entries.
#[derive(Clone)]
pub struct ScriptCache {
    inner: Arc<Inner>,
}

impl ScriptCache {
    pub fn new(
        parser: Arc<dyn ScriptParser>,
        runtime: Arc<dyn ScriptRuntime>,
        fs: Arc<dyn FileSystem>,
        settings: CompilerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: FlyweightCache::new(),
                parser,
                runtime,
                fs,
                settings,
                compiles: AtomicUsize::new(0),
                next_script_id: AtomicU64::new(0),
            }),
        }
    }

    /// JSON AST front end, passthrough runtime, real file system.
    pub fn with_defaults(settings: CompilerSettings) -> Self {
        Self::new(
            Arc::new(JsonAstParser),
            Arc::new(PassthroughRuntime::new()),
            Arc::new(OsFileSystem),
            settings,
        )
    }

    pub fn settings(&self) -> &CompilerSettings {
        &self.inner.settings
    }

    /// Identify the current revision of `path`.
    pub fn signature_for(&self, path: &Path, kind: ScriptKind, version: &str) -> Result<Signature, LoadError> {
        let fs = &self.inner.fs;
        let canonical = fs.canonicalize(path).map_err(|e| LoadError::io(path, &e))?;
        let modified = fs.last_modified(&canonical).map_err(|e| LoadError::io(&canonical, &e))?;
        Ok(Signature::new(canonical, kind, version, modified))
    }

    /// Compile on the calling thread unless the artifact is cached or already
    /// being compiled, in which case wait for that compile.
    pub fn load(&self, signature: Signature) -> Result<Arc<CompiledScript>, LoadError> {
        let inner = &self.inner;
        inner.cache.get_or_load(signature, |sig| inner.compile(sig))
    }

    /// Start a compile in the background, or join the one in flight. Every
    /// caller for the same signature gets a handle to the same load.
    pub fn load_async(&self, signature: Signature) -> ScriptHandle {
        let inner = Arc::clone(&self.inner);
        self.inner
            .cache
            .get_or_spawn(signature, move |completion| spawn_compile(inner, completion))
    }

    /// Ready artifact for `signature`. Never waits.
    pub fn get(&self, signature: &Signature) -> Option<Arc<CompiledScript>> {
        self.inner.cache.get(signature)
    }

    pub fn handle(&self, signature: &Signature) -> Option<ScriptHandle> {
        self.inner.cache.handle(signature)
    }

    pub fn is_load_completed(&self, signature: &Signature) -> bool {
        self.inner.cache.is_completed(signature)
    }

    pub fn set_reserved(&self, signature: &Signature, reserved: bool) -> bool {
        self.inner.cache.set_reserved(signature, reserved)
    }

    pub fn remove_unused(&self) -> usize {
        self.inner.cache.remove_unused()
    }

    /// How many times the pipeline has run.
    pub fn compile_count(&self) -> usize {
        self.inner.compiles.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }
}

fn spawn_compile(inner: Arc<Inner>, completion: Completion<Signature, CompiledScript, LoadError>) {
    let thread_name = inner.settings.worker_thread_name.clone();
    let job = move || {
        let result = inner.compile(completion.key());
        let _ = completion.complete(result);
    };
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        drop(handle.spawn_blocking(job));
        return;
    }
    // A failed spawn drops the job, and with it the completion, which fails
    // the slot as abandoned.
    if let Err(err) = thread::Builder::new().name(thread_name).spawn(job) {
        tracing::warn!(error = %err, "could not start compile thread");
    }
}

impl Inner {
    fn compile(&self, signature: &Signature) -> Result<CompiledScript, LoadError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let path = signature.path.as_path();
        let result = self.run_pipeline(signature);
        match &result {
            Ok(artifact) => tracing::info!(
                script = %path.display(),
                kind = %signature.kind,
                bytes = artifact.bytecode().len(),
                "compiled script"
            ),
            Err(err) => tracing::warn!(script = %path.display(), error = %err, "script failed to compile"),
        }
        result
    }

    fn run_pipeline(&self, signature: &Signature) -> Result<CompiledScript, LoadError> {
        let path = signature.path.as_path();
        let script = self
            .parser
            .parse(path, self.fs.as_ref())
            .map_err(|source| LoadError::Parse { path: path.to_path_buf(), source })?;

        let script_id = self.next_script_id.fetch_add(1, Ordering::SeqCst);
        let options = self.settings.codegen_options(script_id);
        let (generated, stats) = dsl::compile_script(&script, &options)
            .map_err(|errors| LoadError::from_compile_errors(path, &script.files, errors))?;

        let chunk_name = paths::chunk_name(path);
        let bytecode = self
            .runtime
            .compile_to_bytecode(&chunk_name, &generated.source)
            .map_err(|err| runtime_error(path, &chunk_name, &generated.source_map, &err))?;

        let header = ScriptHeader {
            path: path.to_path_buf(),
            kind: signature.kind,
            version: signature.version.clone(),
            script_id,
            headers: script
                .headers
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect(),
            files: script.files.clone(),
            reachable: stats.reachable,
            eliminated: stats.eliminated,
        };
        CompiledScript::new(
            signature.clone(),
            &header,
            &generated.source_map,
            bytecode,
            generated.entry_points,
        )
        .map_err(|e| LoadError::Codegen {
            path: path.to_path_buf(),
            error: CompileError::codegen(format!("cannot serialize artifact: {e}"), SourcePos::default()),
        })
    }
}

/// Re-project a runtime rejection onto the original source.
fn runtime_error(path: &Path, chunk_name: &str, source_map: &SourceMap, err: &RuntimeCompileError) -> LoadError {
    let diagnostic = runtime::classify(chunk_name, &err.message);
    LoadError::Runtime {
        path: path.to_path_buf(),
        message: err.message.clone(),
        location: diagnostic.line.and_then(|line| source_map.location_of(line)),
        limit: diagnostic.limit,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::dsl::ast::Script;
    use crate::dsl::build::*;
    use crate::fs::MemoryFileSystem;
    use crate::runtime::{Bytecode, LimitKind};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::{Duration, SystemTime};

    fn store(fs: &MemoryFileSystem, path: &str, mut script: Script) {
        script.files = vec![path.to_string()];
        fs.insert_at(path, serde_json::to_vec(&script).unwrap(), SystemTime::UNIX_EPOCH);
    }

    fn boss() -> Script {
        script(vec![
            function("Unused", &[], vec![ret(num(0.0))]),
            sub("Fire", vec![call_stmt("CreateShotA1", vec![num(1.0)])]),
            entry("MainLoop", vec![call_stmt("Fire", vec![]), yield_()]),
        ])
    }

    fn cache_with(fs: &Arc<MemoryFileSystem>, runtime: Arc<dyn ScriptRuntime>) -> ScriptCache {
        ScriptCache::new(Arc::new(JsonAstParser), runtime, fs.clone(), CompilerSettings::default())
    }

    fn setup() -> (Arc<MemoryFileSystem>, ScriptCache, Signature) {
        let fs = Arc::new(MemoryFileSystem::new());
        store(&fs, "/s/boss.json", boss());
        let cache = cache_with(&fs, Arc::new(PassthroughRuntime::new()));
        let sig = cache.signature_for(Path::new("/s/boss.json"), ScriptKind::Single, "ph3").unwrap();
        (fs, cache, sig)
    }

    /// Blocks every compile until the test sends a token.
    struct GatedRuntime {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl ScriptRuntime for GatedRuntime {
        fn compile_to_bytecode(&self, _chunk: &str, source: &str) -> Result<Bytecode, RuntimeCompileError> {
            self.gate.lock().recv().expect("gate sender dropped");
            Ok(Bytecode::new(source.as_bytes().to_vec()))
        }
    }

    fn gated() -> (mpsc::Sender<()>, Arc<GatedRuntime>) {
        let (tx, rx) = mpsc::channel();
        (tx, Arc::new(GatedRuntime { gate: Mutex::new(rx) }))
    }

    /// Rejects the first generated line containing `marker` as a locals overflow.
    struct RejectingRuntime {
        marker: &'static str,
    }

    impl ScriptRuntime for RejectingRuntime {
        fn compile_to_bytecode(&self, chunk: &str, source: &str) -> Result<Bytecode, RuntimeCompileError> {
            match source.lines().position(|l| l.contains(self.marker)) {
                Some(i) => Err(RuntimeCompileError::new(format!(
                    "{chunk}:{}: too many local variables (limit is 200)",
                    i + 1
                ))),
                None => Ok(Bytecode::new(source.as_bytes().to_vec())),
            }
        }
    }

    #[test]
    fn second_load_hits_the_cache() {
        let (_fs, cache, sig) = setup();
        let first = cache.load(sig.clone()).unwrap();
        let second = cache.load(sig.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compile_count(), 1);
        assert!(cache.is_load_completed(&sig));
    }

    #[test]
    fn artifact_carries_entries_and_dce_stats() {
        let (_fs, cache, sig) = setup();
        let artifact = cache.load(sig).unwrap();
        let mangled = artifact.mangled_entry("MainLoop").unwrap();
        assert!(mangled.starts_with("dm0_"), "{mangled}");
        let header = artifact.header().unwrap();
        assert_eq!(header.kind, ScriptKind::Single);
        assert_eq!(header.eliminated, 1);
        let source = String::from_utf8(artifact.bytecode().as_bytes().to_vec()).unwrap();
        assert!(!source.contains("Unused"));
        assert!(source.contains("rt_lib.CreateShotA1(1)"), "{source}");
    }

    #[test]
    fn new_modification_time_recompiles() {
        let (fs, cache, old) = setup();
        cache.load(old.clone()).unwrap();
        assert!(fs.touch("/s/boss.json", SystemTime::UNIX_EPOCH + Duration::from_secs(60)));
        let new = cache.signature_for(Path::new("/s/boss.json"), ScriptKind::Single, "ph3").unwrap();
        assert_ne!(old, new);
        cache.load(new).unwrap();
        assert_eq!(cache.compile_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn each_compile_gets_its_own_script_id() {
        let (fs, cache, a) = setup();
        store(&fs, "/s/other.json", boss());
        let b = cache.signature_for(Path::new("/s/other.json"), ScriptKind::Single, "ph3").unwrap();
        let a = cache.load(a).unwrap().header().unwrap().script_id;
        let b = cache.load(b).unwrap().header().unwrap().script_id;
        assert_ne!(a, b);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let (_fs, cache, _) = setup();
        let err = cache
            .signature_for(Path::new("/s/nope.json"), ScriptKind::Stage, "ph3")
            .unwrap_err();
        assert!(matches!(err, LoadError::Io { kind: std::io::ErrorKind::NotFound, .. }), "{err}");
    }

    #[test]
    fn semantic_failures_are_reported_and_not_cached() {
        let fs = Arc::new(MemoryFileSystem::new());
        store(&fs, "/s/bad.json", script(vec![entry("MainLoop", vec![brk().at(3)])]));
        let cache = cache_with(&fs, Arc::new(PassthroughRuntime::new()));
        let sig = cache.signature_for(Path::new("/s/bad.json"), ScriptKind::Single, "ph3").unwrap();

        let err = cache.load(sig.clone()).unwrap_err();
        let LoadError::Semantic { diagnostics, .. } = &err else {
            panic!("expected a semantic error, got {err}");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].pos.line, 3);
        assert!(cache.is_empty());

        cache.load(sig).unwrap_err();
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn runtime_rejection_points_at_the_source_line() {
        let fs = Arc::new(MemoryFileSystem::new());
        let body = script(vec![
            let_("speed", num(1.0)).at(1),
            entry("MainLoop", vec![let_("boom", num(2.0)).at(5), yield_().at(6)]).at(4),
        ]);
        store(&fs, "/s/big.json", body);
        let cache = cache_with(&fs, Arc::new(RejectingRuntime { marker: "v_boom = 2" }));
        let sig = cache.signature_for(Path::new("/s/big.json"), ScriptKind::Stage, "ph3").unwrap();

        let err = cache.load(sig).unwrap_err();
        let LoadError::Runtime { location, limit, .. } = &err else {
            panic!("expected a runtime error, got {err}");
        };
        let location = location.as_ref().unwrap();
        assert_eq!(location.file, "/s/big.json");
        assert_eq!(location.line, 5);
        assert_eq!(*limit, Some(LimitKind::Locals));
    }

    #[test]
    fn rejected_local_declaration_line_maps_to_the_first_declaration() {
        let fs = Arc::new(MemoryFileSystem::new());
        let body = script(vec![
            let_("speed", num(1.0)).at(2),
            let_("angle", num(0.0)).at(3),
            entry("MainLoop", vec![yield_().at(6)]).at(5),
        ]);
        store(&fs, "/s/wide.json", body);
        let cache = cache_with(&fs, Arc::new(RejectingRuntime { marker: "local v_speed, v_angle" }));
        let sig = cache.signature_for(Path::new("/s/wide.json"), ScriptKind::Stage, "ph3").unwrap();

        let err = cache.load(sig).unwrap_err();
        let LoadError::Runtime { location, limit, .. } = &err else {
            panic!("expected a runtime error, got {err}");
        };
        let location = location.as_ref().unwrap();
        assert_eq!(location.file, "/s/wide.json");
        assert_eq!(location.line, 2);
        assert_eq!(*limit, Some(LimitKind::Locals));
    }

    #[test]
    fn eviction_keeps_held_and_reserved_artifacts() {
        let (fs, cache, boss_sig) = setup();
        store(&fs, "/s/pinned.json", boss());
        let pinned = cache.signature_for(Path::new("/s/pinned.json"), ScriptKind::Plural, "ph3").unwrap();

        let held = cache.load(boss_sig.clone()).unwrap();
        drop(cache.load(pinned.clone()).unwrap());
        cache.set_reserved(&pinned, true);
        assert_eq!(cache.remove_unused(), 0);

        drop(held);
        assert_eq!(cache.remove_unused(), 1);
        assert!(cache.get(&boss_sig).is_none());
        assert!(cache.get(&pinned).is_some());

        cache.set_reserved(&pinned, false);
        assert_eq!(cache.remove_unused(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn in_flight_compiles_are_shared_and_never_evicted() {
        let fs = Arc::new(MemoryFileSystem::new());
        store(&fs, "/s/boss.json", boss());
        let (open, runtime) = gated();
        let cache = cache_with(&fs, runtime);
        let sig = cache.signature_for(Path::new("/s/boss.json"), ScriptKind::Single, "ph3").unwrap();

        // No tokio runtime here, so this runs on a named std thread.
        let first = cache.load_async(sig.clone());
        let second = cache.load_async(sig.clone());
        assert!(first.ptr_eq(&second));
        assert!(!cache.is_load_completed(&sig));
        assert!(cache.get(&sig).is_none());
        assert_eq!(cache.remove_unused(), 0);

        open.send(()).unwrap();
        let artifact = first.wait().unwrap();
        assert!(second.is_completed());
        assert!(Arc::ptr_eq(&artifact, &second.try_result().unwrap().unwrap()));
        assert_eq!(cache.compile_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_async_loads_share_one_handle() {
        let fs = Arc::new(MemoryFileSystem::new());
        store(&fs, "/s/boss.json", boss());
        let (open, runtime) = gated();
        let cache = cache_with(&fs, runtime);
        let sig = cache.signature_for(Path::new("/s/boss.json"), ScriptKind::Single, "ph3").unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (cache, sig) = (cache.clone(), sig.clone());
                tokio::spawn(async move { cache.load_async(sig) })
            })
            .collect();
        let handles: Vec<ScriptHandle> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));

        open.send(()).unwrap();
        let results = futures_util::future::join_all(handles.iter().map(|h| h.resolved())).await;
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
        assert_eq!(cache.compile_count(), 1);
    }
}
