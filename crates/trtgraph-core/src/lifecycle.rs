use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::backend::Backend;
use crate::error::{GraphError, GraphResult};
use crate::network::{BuilderConfig, NetworkDefinition};

/// Where an engine came from in this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineSource {
    /// Deserialized from a blob persisted by an earlier run.
    Loaded,
    /// Built from the network definition and persisted.
    Built,
}

/// An engine plus what is known about its serialized blob.
pub struct ObtainedEngine<E> {
    pub engine: E,
    pub source: EngineSource,
    pub blob_bytes: usize,
    /// SHA-256 of the serialized blob.
    pub fingerprint: [u8; 32],
}

impl<E> ObtainedEngine<E> {
    /// First 8 bytes of the fingerprint as hex, for logs.
    pub fn short_fingerprint(&self) -> String {
        self.fingerprint
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Load the engine persisted at `path`, or build, persist and load one.
///
/// The file is an opaque blob owned by the backend; nothing is prepended or
/// checked here. A blob that deserializes to nothing is `EngineLoad`; a build
/// that produces no blob is `EngineBuild`.
pub fn obtain_engine<B: Backend>(
    backend: &B,
    path: &Path,
    network: &NetworkDefinition,
    config: &BuilderConfig,
) -> GraphResult<ObtainedEngine<B::Engine>> {
    if path.is_file() {
        let blob = fs::read(path)?;
        let engine = deserialize(backend, &blob, path)?;
        tracing::info!(
            path = %path.display(),
            bytes = blob.len(),
            backend = backend.name(),
            "loaded engine"
        );
        return Ok(ObtainedEngine {
            engine,
            source: EngineSource::Loaded,
            blob_bytes: blob.len(),
            fingerprint: Sha256::digest(&blob).into(),
        });
    }

    tracing::info!(
        path = %path.display(),
        workspace_bytes = config.workspace_bytes,
        backend = backend.name(),
        "no persisted engine, building"
    );
    let blob = match backend.build_serialized_network(network, config)? {
        Some(blob) if !blob.is_empty() => blob,
        Some(_) => {
            return Err(GraphError::EngineBuild {
                reason: "builder returned an empty plan".into(),
            })
        }
        None => {
            return Err(GraphError::EngineBuild {
                reason: "builder returned no plan".into(),
            })
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &blob)?;
    tracing::info!(path = %path.display(), bytes = blob.len(), "engine built and persisted");

    let engine = deserialize(backend, &blob, path)?;
    Ok(ObtainedEngine {
        engine,
        source: EngineSource::Built,
        blob_bytes: blob.len(),
        fingerprint: Sha256::digest(&blob).into(),
    })
}

fn deserialize<B: Backend>(backend: &B, blob: &[u8], path: &Path) -> GraphResult<B::Engine> {
    backend
        .deserialize_engine(blob)?
        .ok_or_else(|| GraphError::EngineLoad {
            path: path.to_path_buf(),
        })
}

/// Remove every file in `dir` whose extension is `extension`. Returns the
/// number of files removed; a missing directory removes nothing.
pub fn clear_persisted_engines(dir: &Path, extension: &str) -> GraphResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "removed persisted engine");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceBackend;
    use crate::test_util::{demo_builder_config, demo_network};

    #[test]
    fn builds_then_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.trt");
        let backend = ReferenceBackend::new();

        let built = obtain_engine(&backend, &path, &demo_network(), &demo_builder_config()).unwrap();
        assert_eq!(built.source, EngineSource::Built);
        assert!(path.is_file());
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, built.blob_bytes);

        let loaded = obtain_engine(&backend, &path, &demo_network(), &demo_builder_config()).unwrap();
        assert_eq!(loaded.source, EngineSource::Loaded);
        assert_eq!(loaded.fingerprint, built.fingerprint);
        assert_eq!(backend.stats().engines_built, 1, "second call must not rebuild");
        assert_eq!(loaded.short_fingerprint().len(), 16);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/cache/engine.trt");
        let backend = ReferenceBackend::new();
        obtain_engine(&backend, &path, &demo_network(), &demo_builder_config()).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn corrupt_file_is_load_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.trt");
        fs::write(&path, b"garbage").unwrap();
        let backend = ReferenceBackend::new();

        let err = obtain_engine(&backend, &path, &demo_network(), &demo_builder_config())
            .err()
            .expect("corrupt engine must fail");
        assert!(matches!(err, GraphError::EngineLoad { .. }));
        assert!(err.is_engine_unavailable());
        assert_eq!(backend.stats().engines_built, 0, "load path never builds");
    }

    #[test]
    fn rejected_network_is_build_failure_and_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.trt");
        let backend = ReferenceBackend::new();
        let mut network = demo_network();
        network.outputs.clear();

        let err = obtain_engine(&backend, &path, &network, &demo_builder_config())
            .err()
            .expect("network without outputs must fail");
        assert!(matches!(err, GraphError::EngineBuild { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn clears_only_matching_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.trt"), b"x").unwrap();
        fs::write(dir.path().join("b.trt"), b"y").unwrap();
        fs::write(dir.path().join("keep.onnx"), b"z").unwrap();

        assert_eq!(clear_persisted_engines(dir.path(), "trt").unwrap(), 2);
        assert!(dir.path().join("keep.onnx").exists());
        assert_eq!(clear_persisted_engines(dir.path(), "trt").unwrap(), 0);
        assert_eq!(
            clear_persisted_engines(&dir.path().join("missing"), "trt").unwrap(),
            0
        );
    }
}
