use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::api::{
    ControlPlane, CreateDatasetRequest, FinalizeRequest, StsCredentials, VisibilityRange,
};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::oss::{ResumableUpload, TransferConfig, UploadRequest};

const ALLOWED_EXTENSIONS: &[&str] = &[".zip", ".tar.gz"];

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Dataset name; defaults to the file name.
    pub name: Option<String>,
    pub range: VisibilityRange,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

/// Rejects unsupported or missing inputs before any state is touched.
pub fn validate_source(path: &Path) -> Result<SourceFile> {
    let Some(filename) = path.file_name().and_then(|s| s.to_str()).map(str::to_string) else {
        return Err(Error::validation(format!(
            "invalid file path '{}'",
            path.display()
        )));
    };
    if !ALLOWED_EXTENSIONS.iter().any(|ext| filename.ends_with(ext)) {
        return Err(Error::validation(
            "uploading file should be one of .zip or .tar.gz type",
        ));
    }
    let meta = fs::metadata(path).map_err(|_| {
        Error::validation(format!("file '{}' does not exist", path.display()))
    })?;
    if !meta.is_file() {
        return Err(Error::validation(format!(
            "'{}' is not a regular file",
            path.display()
        )));
    }
    Ok(SourceFile {
        path: path.to_path_buf(),
        filename,
        size: meta.len(),
    })
}

/// Per-invocation upload state: the (possibly resumed) checkpoint plus
/// fresh storage credentials. Never persisted; the checkpoint underneath it
/// provides cross-process continuity.
#[derive(Debug, Clone)]
pub struct Session {
    pub fingerprint: String,
    pub checkpoint: Checkpoint,
    pub credentials: StsCredentials,
}

impl Session {
    /// Remote object path for this dataset's payload.
    pub fn object_key(&self, filename: &str) -> String {
        format!(
            "{}_{}/{}",
            self.checkpoint.uploader_id, self.checkpoint.id, filename
        )
    }
}

/// Resume from an existing checkpoint, or create a fresh remote dataset
/// record and checkpoint it.
///
/// On the miss path the checkpoint is written immediately after the create
/// response, before any further remote call, so a later run can never issue
/// a second create for the same fingerprint. A found checkpoint is trusted
/// verbatim; the remote record is not revalidated.
pub fn bootstrap(
    api: &dyn ControlPlane,
    store: &CheckpointStore,
    source: &SourceFile,
    opts: &UploadOptions,
) -> Result<Session> {
    let fp = fingerprint(&source.filename, source.size);
    let checkpoint = match store.load(&fp)? {
        Some(cp) => {
            info!(dataset_id = %cp.id, consumed_bytes = cp.consumed_bytes, "resuming from checkpoint");
            cp
        }
        None => {
            let req = CreateDatasetRequest {
                name: opts
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| source.filename.clone()),
                range: opts.range,
                description: opts.description.clone(),
            };
            let record = api.create_dataset(&req)?;
            let cp = Checkpoint {
                id: record.id,
                dataset_center: record.dataset_center,
                uploader_id: record.uploader_id,
                consumed_bytes: 0,
            };
            store.save(&fp, &cp)?;
            info!(dataset_id = %cp.id, "created dataset record");
            cp
        }
    };

    // Tokens are short-lived; always fetch fresh ones.
    let credentials = api.storage_credentials()?;
    Ok(Session {
        fingerprint: fp,
        checkpoint,
        credentials,
    })
}

/// Drives the backend primitive, persisting cumulative `consumed_bytes`
/// into the checkpoint on every tick before forwarding it to the caller's
/// progress sink.
///
/// The checkpoint layer does not tell the backend what to skip; the
/// backend's own scratch state under the checkpoint directory decides what
/// remains.
pub fn transfer(
    backend: &dyn ResumableUpload,
    store: &CheckpointStore,
    session: &mut Session,
    source: &SourceFile,
    config: &TransferConfig,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let key = session.object_key(&source.filename);
    let scratch_root = store.scratch_dir(&session.fingerprint);
    fs::create_dir_all(&scratch_root)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", scratch_root.display())))?;
    let req = UploadRequest {
        key: &key,
        local: &source.path,
        scratch_root: &scratch_root,
        config,
    };

    let fp = session.fingerprint.clone();
    let mut checkpoint = session.checkpoint.clone();
    let mut save_err: Option<Error> = None;
    debug!(key = %key, "starting transfer");
    let status = backend.upload(&req, &mut |consumed, total| {
        checkpoint.consumed_bytes = consumed;
        if let Err(e) = store.save(&fp, &checkpoint) {
            save_err.get_or_insert(e);
        }
        progress(consumed, total);
    })?;
    session.checkpoint = checkpoint;
    if let Some(e) = save_err {
        return Err(e);
    }
    if status != 200 {
        return Err(Error::Transfer(status));
    }
    Ok(())
}

/// Reports completion to the control plane, then clears the checkpoint.
/// This is the only path that deletes a checkpoint: a failed remote ack
/// leaves everything on disk so a re-run can retry finalization without
/// re-uploading.
pub fn finalize(
    api: &dyn ControlPlane,
    store: &CheckpointStore,
    session: &Session,
    source: &SourceFile,
    storage_endpoint: &str,
) -> Result<()> {
    let req = FinalizeRequest {
        uploaded: true,
        domain: format!(
            "{}.{storage_endpoint}",
            session.checkpoint.dataset_center.bucket
        ),
        path: session.object_key(&source.filename),
        size: source.size,
        filename: source.filename.clone(),
    };
    api.finalize_dataset(&session.checkpoint.id, &req)?;
    store.delete(&session.fingerprint)?;
    info!(dataset_id = %session.checkpoint.id, "upload finalized");
    Ok(())
}

/// Builds the storage backend once the session (bucket identity plus fresh
/// credentials) is known.
pub type BackendFactory<'a> = &'a dyn Fn(&Session) -> Result<Box<dyn ResumableUpload>>;

/// Full upload pipeline: validate, lock, bootstrap, transfer, finalize.
/// Any failure past bootstrap leaves the checkpoint in place for the next
/// invocation to resume from.
pub fn run(
    api: &dyn ControlPlane,
    store: &CheckpointStore,
    make_backend: BackendFactory<'_>,
    path: &Path,
    opts: &UploadOptions,
    config: &TransferConfig,
    storage_endpoint: &str,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let source = validate_source(path)?;
    let fp = fingerprint(&source.filename, source.size);
    let _guard = store.lock(&fp)?;

    let mut session = bootstrap(api, store, &source, opts)?;
    let backend = make_backend(&session)?;
    transfer(
        backend.as_ref(),
        store,
        &mut session,
        &source,
        config,
        progress,
    )?;
    finalize(api, store, &session, &source, storage_endpoint)
}
