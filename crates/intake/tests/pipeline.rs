//! End-to-end pipeline scenarios driven through the service surface,
//! with a fake backing-store CLI standing in for the real tool.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use intake::job::model::EntryStatus;
use intake::service::{FileDecl, JobSummary, StartJobRequest};
use intake::{
    ChunkUpload, CliDataStore, IntakeConfig, IntakeContext, JobStatus, NullDataStore,
    SpecialUpload, StoreCli, StoreSession, UploadService,
};
use tempfile::TempDir;

const FAKE_TOOL: &str = r#"#!/bin/sh
cmd=$1
if [ "$cmd" = "import" ] && [ "$2" = "-f" ]; then
    case "$3" in
        *incompat*) echo "unknown format" >&2 ;;
        *) echo "$3" ;;
    esac
    exit 0
fi
if [ "$cmd" = "import" ]; then
    for a; do p=$a; done
    case "$p" in
        *fail*) echo "error: import blew up" >&2; exit 1 ;;
        *) echo "imported $p" ;;
    esac
    exit 0
fi
if [ "$cmd" = "lookup" ]; then
    shift 7
    i=100
    for n in "$@"; do
        i=$((i+1))
        printf '%s\t%s\n' "$n" "$i"
    done
    exit 0
fi
if [ "$cmd" = "attach" ]; then
    exit 0
fi
echo "unknown subcommand $cmd" >&2
exit 2
"#;

fn fake_tool(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-store-cli");
    std::fs::write(&path, FAKE_TOOL).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn session() -> StoreSession {
    StoreSession {
        key: Some("sessionkey".to_string()),
        host: Some("localhost".to_string()),
        port: Some(4064),
    }
}

fn build_service(dir: &TempDir, with_cli_datastore: bool) -> UploadService {
    let tool = fake_tool(dir.path());
    let config = IntakeConfig {
        staging_root: dir.path().join("uploads"),
        cli_path: tool.clone(),
        probe_timeout: Duration::from_secs(10),
        import_timeout: Duration::from_secs(10),
        ..IntakeConfig::default()
    };
    let ctx = IntakeContext::new(config).unwrap();
    if with_cli_datastore {
        let datastore = CliDataStore::new(StoreCli::new(tool), session(), Duration::from_secs(10));
        UploadService::new(ctx, Arc::new(datastore))
    } else {
        UploadService::new(ctx, Arc::new(NullDataStore))
    }
}

fn start_with(
    service: &UploadService,
    files: &[(&str, i64)],
    special_upload: Option<SpecialUpload>,
) -> String {
    service
        .start_job(StartJobRequest {
            owner: "alice".to_string(),
            session: session(),
            target_container_id: None,
            special_upload,
            batch_size: None,
            files: files
                .iter()
                .map(|(path, size)| FileDecl {
                    relative_path: path.to_string(),
                    size: *size,
                })
                .collect(),
        })
        .unwrap()
        .job_id
}

fn start(service: &UploadService, files: &[(&str, i64)]) -> String {
    start_with(service, files, None)
}

fn upload_all(service: &UploadService, job_id: &str, files: &[(&str, i64)]) {
    let chunks = files
        .iter()
        .map(|(path, size)| ChunkUpload {
            relative_path: path.to_string(),
            bytes: vec![b'x'; *size as usize],
        })
        .collect();
    service.submit_chunk(job_id, chunks).unwrap();
}

fn wait_for(
    service: &UploadService,
    job_id: &str,
    pred: impl Fn(&JobSummary) -> bool,
) -> JobSummary {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let summary = service.status(job_id).unwrap();
        if pred(&summary) {
            return summary;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting; last status {:?}, errors {:?}",
            summary.status,
            summary.errors
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn incompatible_file_pauses_then_confirm_completes_the_job() {
    let dir = TempDir::new().unwrap();
    let service = build_service(&dir, false);
    let files = [
        ("run/a.tif", 10_i64),
        ("run/b_incompat.raw", 20),
        ("run/c.tif", 30),
    ];
    let job_id = start(&service, &files);
    upload_all(&service, &job_id, &files);

    let paused = wait_for(&service, &job_id, |s| {
        s.status == JobStatus::AwaitingConfirmation
    });
    assert_eq!(paused.uploaded_bytes, 60);
    assert_eq!(paused.incompatible_paths, vec!["run/b_incompat.raw"]);

    service.confirm(&job_id).unwrap();
    let done = wait_for(&service, &job_id, |s| s.status.is_terminal());

    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.imported_bytes, 60);
    let by_path = |path: &str| {
        done.files
            .iter()
            .find(|f| f.relative_path == path)
            .unwrap()
            .status
    };
    assert_eq!(by_path("run/a.tif"), EntryStatus::Imported);
    assert_eq!(by_path("run/b_incompat.raw"), EntryStatus::Skipped);
    assert_eq!(by_path("run/c.tif"), EntryStatus::Imported);

    // Imported payloads were deleted from staging.
    let job = service.store().load(&job_id).unwrap();
    assert!(!job.entry("run/a.tif").unwrap().staged_path.exists());
    assert!(!job.entry("run/c.tif").unwrap().staged_path.exists());
}

#[test]
fn failed_import_credits_bytes_and_ends_in_error() {
    let dir = TempDir::new().unwrap();
    let service = build_service(&dir, false);
    let files = [("ok.tif", 10_i64), ("will_fail.tif", 20)];
    let job_id = start(&service, &files);
    upload_all(&service, &job_id, &files);

    let done = wait_for(&service, &job_id, |s| s.status.is_terminal());
    assert_eq!(done.status, JobStatus::Error);
    assert_eq!(done.imported_bytes, 30);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("will_fail.tif"));

    let ok = done
        .files
        .iter()
        .find(|f| f.relative_path == "ok.tif")
        .unwrap();
    assert_eq!(ok.status, EntryStatus::Imported);
}

#[test]
fn concurrent_submits_are_both_reflected_in_status() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(build_service(&dir, false));
    let files = [("a.tif", 10_i64), ("b.tif", 20)];
    let job_id = start(&service, &files);

    let handles: Vec<_> = files
        .iter()
        .map(|(path, size)| {
            let service = Arc::clone(&service);
            let job_id = job_id.clone();
            let path = path.to_string();
            let size = *size as usize;
            std::thread::spawn(move || {
                service
                    .submit_chunk(
                        &job_id,
                        vec![ChunkUpload {
                            relative_path: path,
                            bytes: vec![b'x'; size],
                        }],
                    )
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let summary = wait_for(&service, &job_id, |s| s.uploaded_bytes == 30);
    assert!(summary
        .files
        .iter()
        .all(|f| f.status != EntryStatus::Pending));
}

#[test]
fn sidecar_is_attached_after_its_image_imports() {
    let dir = TempDir::new().unwrap();
    let service = build_service(&dir, true);
    let files = [("run/scan.tif", 10_i64), ("run/spectra.txt", 2)];
    let job_id = start_with(&service, &files, Some(SpecialUpload::SemEdxSpectra));
    upload_all(&service, &job_id, &files);

    let done = wait_for(&service, &job_id, |s| s.status.is_terminal());
    assert_eq!(done.status, JobStatus::Done, "errors: {:?}", done.errors);
    assert_eq!(done.imported_bytes, 12);

    let sidecar = done
        .files
        .iter()
        .find(|f| f.relative_path == "run/spectra.txt")
        .unwrap();
    assert_eq!(sidecar.status, EntryStatus::Imported);
    assert!(done
        .messages
        .iter()
        .any(|m| m.contains("Attached sidecar")));
}

#[test]
fn prune_withdraws_files_before_import() {
    let dir = TempDir::new().unwrap();
    let service = build_service(&dir, false);
    let files = [("keep.tif", 10_i64), ("drop.tif", 20)];
    let job_id = start(&service, &files);

    // Upload only the kept file, then withdraw the other.
    service
        .submit_chunk(
            &job_id,
            vec![ChunkUpload {
                relative_path: "keep.tif".to_string(),
                bytes: vec![b'x'; 10],
            }],
        )
        .unwrap();
    let summary = service.prune(&job_id, &["keep.tif".to_string()]).unwrap();
    assert_eq!(summary.total_bytes, 10);
    assert_eq!(summary.files.len(), 1);

    let done = wait_for(&service, &job_id, |s| s.status.is_terminal());
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.imported_bytes, 10);
}
