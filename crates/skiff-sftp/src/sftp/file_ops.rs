//! Filesystem operations on a session's SFTP channel.

use crate::sftp::service::SftpService;
use crate::sftp::transfer::{collect_remote_entries, walk_remote};
use crate::sftp::types::RemoteEntry;
use log::info;
use skiff_core::SkiffResult;

impl SftpService {
    /// Lists a directory, directories first, names compared
    /// case-insensitively. Dotfiles stay out unless asked for.
    pub async fn list_dir(
        &self,
        session_id: &str,
        path: &str,
        show_hidden: bool,
    ) -> SkiffResult<Vec<RemoteEntry>> {
        let fs = self.remote(session_id)?;
        let mut entries: Vec<RemoteEntry> = fs
            .list_dir(path)?
            .into_iter()
            .filter(|entry| show_hidden || !entry.name.starts_with('.'))
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> SkiffResult<RemoteEntry> {
        self.remote(session_id)?.stat(path)
    }

    /// The channel's resolved working directory.
    pub async fn getwd(&self, session_id: &str) -> SkiffResult<String> {
        self.remote(session_id)?.getwd()
    }

    /// Creates an empty file; an existing path is an error.
    pub async fn create_file(&self, session_id: &str, path: &str) -> SkiffResult<()> {
        self.remote(session_id)?.create_file(path)?;
        info!("SFTP created file {}", path);
        Ok(())
    }

    /// Creates one directory; an existing path is an error.
    pub async fn create_dir(&self, session_id: &str, path: &str) -> SkiffResult<()> {
        self.remote(session_id)?.create_dir(path)?;
        info!("SFTP created directory {}", path);
        Ok(())
    }

    /// Renames without clobbering: an existing target is an error.
    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> SkiffResult<()> {
        self.remote(session_id)?.rename(from, to)?;
        info!("SFTP renamed {} -> {}", from, to);
        Ok(())
    }

    /// Removes a path: files directly, directories with their whole
    /// tree. The tree is collected first and deleted in reverse, so
    /// contents always go before their parent directory.
    pub async fn delete(&self, session_id: &str, path: &str) -> SkiffResult<()> {
        let fs = self.remote(session_id)?;
        let target = fs.stat(path)?;
        if !target.is_dir {
            fs.remove_file(path)?;
            info!("SFTP deleted file {}", path);
            return Ok(());
        }

        let collected = collect_remote_entries(fs.as_ref(), path)?;
        for entry in collected.iter().rev() {
            if entry.is_dir {
                fs.remove_dir(&entry.path)?;
            } else {
                fs.remove_file(&entry.path)?;
            }
        }
        fs.remove_dir(path)?;
        info!(
            "SFTP deleted tree {} ({} entries)",
            path,
            collected.len() + 1
        );
        Ok(())
    }

    /// Total size in bytes of a remote tree, the fixed denominator a
    /// download of that tree would use.
    pub async fn dir_size(&self, session_id: &str, path: &str) -> SkiffResult<u64> {
        let fs = self.remote(session_id)?;
        Ok(walk_remote(fs.as_ref(), path)?.total)
    }
}

fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        // Directories first, always
        let dir_cmp = b.is_dir.cmp(&a.is_dir);
        if dir_cmp != std::cmp::Ordering::Equal {
            return dir_cmp;
        }
        a.name.to_lowercase().cmp(&b.name.to_lowercase())
    });
}

#[cfg(test)]
mod tests {
    use crate::sftp::fs::RemoteFs;
    use crate::sftp::service::testing::{mem_service, PresetDialogs};
    use skiff_core::ErrorKind;

    #[tokio::test]
    async fn listing_sorts_dirs_first_and_hides_dotfiles() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        fs.seed_dir("/home");
        fs.seed_file("/home/zeta.txt", b"z");
        fs.seed_dir("/home/Beta");
        fs.seed_file("/home/.hidden", b"h");
        fs.seed_dir("/home/alpha");

        let names: Vec<String> = service
            .list_dir("s1", "/home", false)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["alpha", "Beta", "zeta.txt"]);

        let with_hidden = service.list_dir("s1", "/home", true).await.unwrap();
        assert_eq!(with_hidden.len(), 4);
    }

    #[tokio::test]
    async fn creates_refuse_existing_paths() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        service.create_file("s1", "/a.txt").await.unwrap();
        let err = service.create_file("s1", "/a.txt").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SftpFailed);

        service.create_dir("s1", "/d").await.unwrap();
        assert!(service.create_dir("s1", "/d").await.is_err());

        assert!(fs.contents("/a.txt").unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_moves_but_never_clobbers() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        fs.seed_file("/a", b"data");
        service.rename("s1", "/a", "/b").await.unwrap();
        assert_eq!(fs.contents("/b").unwrap(), b"data");

        fs.seed_file("/a", b"other");
        let err = service.rename("s1", "/a", "/b").await.unwrap_err();
        assert!(err.message.contains("already exists"));
        assert_eq!(fs.contents("/b").unwrap(), b"data");
    }

    #[tokio::test]
    async fn delete_removes_whole_trees() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        fs.seed_dir("/top");
        fs.seed_file("/top/a", b"1");
        fs.seed_dir("/top/sub");
        fs.seed_file("/top/sub/b", b"22");

        service.delete("s1", "/top").await.unwrap();
        assert!(!fs.exists("/top").unwrap());
        assert!(!fs.exists("/top/sub/b").unwrap());

        fs.seed_file("/single", b"x");
        service.delete("s1", "/single").await.unwrap();
        assert!(!fs.exists("/single").unwrap());

        let err = service.delete("s1", "/gone").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SftpFailed);
    }

    #[tokio::test]
    async fn dir_size_matches_the_transfer_denominator() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        fs.seed_dir("/pack");
        fs.seed_file("/pack/a.txt", &[1u8; 10]);
        fs.seed_dir("/pack/sub");
        fs.seed_file("/pack/sub/b.txt", &[2u8; 20]);

        assert_eq!(service.dir_size("s1", "/pack").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn getwd_and_stat_resolve_through_the_channel() {
        let (service, fs, _events) = mem_service(PresetDialogs::new(None, None));
        assert_eq!(service.getwd("s1").await.unwrap(), "/");

        fs.seed_file("/notes", b"abc");
        let entry = service.stat("s1", "/notes").await.unwrap();
        assert_eq!(entry.size, 3);
        assert!(!entry.is_dir);
        assert!(service.stat("s1", "/missing").await.is_err());

        let err = service.getwd("ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
    }
}
