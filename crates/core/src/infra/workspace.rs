use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::domain::error::AppError;
use crate::domain::job::JobId;
use crate::infra::metrics::Metrics;

/// sweep 1回分の削除件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub files_removed: u32,
    pub dirs_removed: u32,
}

/// ジョブごとの作業ディレクトリと出力ファイルを管理する。
///
/// 作業ディレクトリは `<upload_root>/<job_id>`。出力ファイルは
/// `output_root` 直下にフラットに置かれ、ファイル名で参照される。
pub struct WorkspaceManager {
    upload_root: PathBuf,
    output_root: PathBuf,
    retention: Duration,
    metrics: Arc<Metrics>,
}

impl WorkspaceManager {
    pub fn new(
        upload_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        retention: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            upload_root: upload_root.into(),
            output_root: output_root.into(),
            retention,
            metrics,
        }
    }

    /// 親ディレクトリを作成する
    pub fn ensure_roots(&self) -> Result<(), AppError> {
        for dir in [&self.upload_root, &self.output_root] {
            std::fs::create_dir_all(dir).map_err(|e| {
                AppError::storage(format!("Failed to create directory {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn workspace_path(&self, job_id: &JobId) -> PathBuf {
        self.upload_root.join(job_id.as_str())
    }

    /// ジョブ用の作業ディレクトリを確保する
    pub fn allocate(&self, job_id: &JobId) -> Result<PathBuf, AppError> {
        let path = self.workspace_path(job_id);
        std::fs::create_dir_all(&path).map_err(|e| {
            AppError::storage(format!("Failed to create workspace {}: {e}", path.display()))
        })?;
        log::debug!("Allocated workspace for job {job_id}: {}", path.display());
        Ok(path)
    }

    /// 作業ディレクトリを再帰削除する。失敗はログのみで呼び出し元には返さない。
    pub fn release(&self, job_id: &JobId) -> bool {
        self.metrics.inc_workspace_releases();
        let path = self.workspace_path(job_id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                log::debug!("Released workspace for job {job_id}");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Workspace for job {job_id} was never allocated");
                false
            }
            Err(e) => {
                log::warn!("Error cleaning up workspace {}: {e}", path.display());
                false
            }
        }
    }

    /// 保持期間を過ぎた出力ファイルと作業ディレクトリを削除する。
    ///
    /// ジョブの追跡状態とは無関係に mtime だけで判定する。
    pub fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        for (path, is_dir) in list_entries(&self.output_root) {
            if !is_dir && self.is_expired(&path, now) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        log::info!("Deleted old file: {}", path.display());
                        report.files_removed += 1;
                    }
                    Err(e) => log::warn!("Failed to delete {}: {e}", path.display()),
                }
            }
        }

        for (path, is_dir) in list_entries(&self.upload_root) {
            if is_dir && self.is_expired(&path, now) {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        log::info!("Deleted old task directory: {}", path.display());
                        report.dirs_removed += 1;
                    }
                    Err(e) => log::warn!("Failed to delete {}: {e}", path.display()),
                }
            }
        }

        report
    }

    /// 出力ファイル名をパスに解決する（ディレクトリ外への参照は拒否）
    pub fn resolve_output(&self, filename: &str) -> Result<PathBuf, AppError> {
        validate_filename(filename)?;
        let path = self.output_root.join(filename);
        if !path.is_file() {
            return Err(AppError::not_found(format!("File not found: {filename}")));
        }
        Ok(path)
    }

    pub fn delete_output(&self, filename: &str) -> Result<(), AppError> {
        let path = self.resolve_output(filename)?;
        std::fs::remove_file(&path)
            .map_err(|e| AppError::storage(format!("Failed to delete {filename}: {e}")))?;
        log::info!("Deleted output file: {filename}");
        Ok(())
    }

    fn is_expired(&self, path: &Path, now: SystemTime) -> bool {
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                log::debug!("Cannot read mtime of {}: {e}", path.display());
                return false;
            }
        };
        now.duration_since(modified)
            .map(|age| age > self.retention)
            .unwrap_or(false)
    }
}

fn list_entries(dir: &Path) -> Vec<(PathBuf, bool)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Error in cleanup task reading {}: {e}", dir.display());
            }
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let is_dir = entry.file_type().ok()?.is_dir();
            Some((entry.path(), is_dir))
        })
        .collect()
}

fn validate_filename(filename: &str) -> Result<(), AppError> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(AppError::validation(format!("Invalid file name: {filename:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(24 * 3600);

    fn manager(root: &Path) -> (WorkspaceManager, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let manager = WorkspaceManager::new(
            root.join("temp_files"),
            root.join("output_files"),
            RETENTION,
            metrics.clone(),
        );
        manager.ensure_roots().unwrap();
        (manager, metrics)
    }

    #[test]
    fn allocate_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, metrics) = manager(dir.path());
        let id = JobId::from("job-1");

        let path = ws.allocate(&id).unwrap();
        std::fs::write(path.join("video.mp4"), b"data").unwrap();
        assert!(path.is_dir());

        assert!(ws.release(&id));
        assert!(!path.exists());
        assert_eq!(metrics.summary().workspace_releases, 1);
    }

    #[test]
    fn allocate_under_a_file_reports_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let ws = WorkspaceManager::new(
            &blocker,
            dir.path().join("out"),
            RETENTION,
            Arc::new(Metrics::new()),
        );

        let err = ws.allocate(&JobId::from("job-x")).unwrap_err();
        assert!(err.message.starts_with("Failed to create workspace"), "{}", err.message);
    }

    #[test]
    fn release_of_missing_workspace_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, metrics) = manager(dir.path());
        assert!(!ws.release(&JobId::from("never")));
        assert_eq!(metrics.summary().workspace_releases, 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, _) = manager(dir.path());
        ws.allocate(&JobId::from("job-1")).unwrap();
        std::fs::write(ws.output_root().join("a.mp4"), b"a").unwrap();

        let fresh = ws.sweep(SystemTime::now());
        assert_eq!(fresh, SweepReport::default());

        let later = SystemTime::now() + RETENTION + Duration::from_secs(3600);
        let report = ws.sweep(later);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.dirs_removed, 1);
        assert!(!ws.workspace_path(&JobId::from("job-1")).exists());
    }

    #[test]
    fn sweep_tolerates_missing_roots() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(
            dir.path().join("nope"),
            dir.path().join("nada"),
            RETENTION,
            Arc::new(Metrics::new()),
        );
        assert_eq!(ws.sweep(SystemTime::now()), SweepReport::default());
    }

    #[test]
    fn resolve_and_delete_output() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, _) = manager(dir.path());
        std::fs::write(ws.output_root().join("out.mp4"), b"x").unwrap();

        let path = ws.resolve_output("out.mp4").unwrap();
        assert!(path.ends_with("out.mp4"));

        ws.delete_output("out.mp4").unwrap();
        assert!(ws.resolve_output("out.mp4").unwrap_err().is_not_found());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, _) = manager(dir.path());
        for name in ["../secret", "/etc/passwd", "a/b.mp4", "", ".."] {
            let err = ws.resolve_output(name).unwrap_err();
            assert_eq!(err.code, crate::domain::error::ErrorCode::Validation, "{name}");
        }
    }
}
