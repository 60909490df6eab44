use std::collections::VecDeque;

use drev_core::{join_remote, CandidateFolder};
use drev_storage::{RemoteSession, TransportError};
use tracing::debug;

struct Frame {
    /// Segments below the root leading to this frame's directory.
    prefix: Vec<String>,
    pending: VecDeque<String>,
}

/// Lazy depth-first enumeration of `root/<date>/<group>{depth}/<leaf>`.
///
/// A directory is listed only when the walk reaches it, so work already done
/// for earlier candidates is not repeated and an aborted run stops listing
/// immediately. Leaf folders are yielded, never listed.
pub struct RemoteTreeWalker {
    root: String,
    group_depth: usize,
    stack: Vec<Frame>,
    started: bool,
}

impl RemoteTreeWalker {
    pub fn new(root: impl Into<String>, group_depth: usize) -> Self {
        Self {
            root: root.into(),
            group_depth,
            stack: Vec::new(),
            started: false,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Restarts enumeration from the root on the next call to [`Self::next`].
    pub fn reset(&mut self) {
        self.stack.clear();
        self.started = false;
    }

    async fn list_dirs(
        &self,
        session: &mut dyn RemoteSession,
        segments: &[String],
    ) -> Result<VecDeque<String>, TransportError> {
        let path = join_remote(&self.root, &segments.join("/"));
        let entries = session.list(&path).await?;
        let dirs = entries
            .into_iter()
            .filter(|entry| entry.is_dir())
            .map(|entry| entry.name)
            .collect::<VecDeque<_>>();
        debug!(path = %path, dirs = dirs.len(), "listed remote directory");
        Ok(dirs)
    }

    pub async fn next(
        &mut self,
        session: &mut dyn RemoteSession,
    ) -> Result<Option<CandidateFolder>, TransportError> {
        if !self.started {
            let pending = self.list_dirs(session, &[]).await?;
            self.stack.push(Frame {
                prefix: Vec::new(),
                pending,
            });
            self.started = true;
        }

        let leaf_depth = self.group_depth + 2;
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(name) = frame.pending.pop_front() else {
                self.stack.pop();
                continue;
            };
            let mut segments = frame.prefix.clone();
            segments.push(name);

            if segments.len() == leaf_depth {
                let leaf = segments.pop().unwrap_or_default();
                let mut rest = segments.into_iter();
                let date_folder = rest.next().unwrap_or_default();
                return Ok(Some(CandidateFolder {
                    root: self.root.clone(),
                    date_folder,
                    groups: rest.collect(),
                    leaf,
                }));
            }

            let pending = self.list_dirs(session, &segments).await?;
            self.stack.push(Frame {
                prefix: segments,
                pending,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drev_storage::{MemoryRemote, RemoteConnector};

    async fn drain(
        walker: &mut RemoteTreeWalker,
        session: &mut dyn RemoteSession,
    ) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(candidate) = walker.next(session).await.unwrap() {
            out.push(candidate.relative_path());
        }
        out
    }

    #[tokio::test]
    async fn walks_flat_layout_depth_first() {
        let remote = MemoryRemote::new();
        remote.add_dir("/calls/2025-01-14/in-1-250114-090000");
        remote.add_dir("/calls/2025-01-14/out-2-250114-100000");
        remote.add_file("/calls/2025-01-14/in-1-250114-090000/dialog.txt", "x");
        remote.add_dir("/calls/2025-01-15/in-3-250115-090000");
        remote.add_file("/calls/notes.txt", "x");
        remote.add_file("/calls/2025-01-15/stray.json", "x");

        let mut session = remote.connect().await.unwrap();
        let mut walker = RemoteTreeWalker::new("/calls", 0);
        assert_eq!(
            drain(&mut walker, session.as_mut()).await,
            vec![
                "2025-01-14/in-1-250114-090000",
                "2025-01-14/out-2-250114-100000",
                "2025-01-15/in-3-250115-090000",
            ]
        );
        // root + two date folders; leaves are never listed
        assert_eq!(remote.list_count(), 3);
        assert!(walker.next(session.as_mut()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn walks_grouped_layout_and_skips_empty_groups() {
        let remote = MemoryRemote::new();
        remote.add_dir("/fito/14.01.25/3-14-05-00/d1");
        remote.add_dir("/fito/14.01.25/3-14-05-00/d2");
        remote.add_dir("/fito/14.01.25/4-15-00-00");
        remote.add_dir("/fito/15.01.25/1-09-00-00/d3");

        let mut session = remote.connect().await.unwrap();
        let mut walker = RemoteTreeWalker::new("/fito/", 1);
        let first = walker.next(session.as_mut()).await.unwrap().unwrap();
        assert_eq!(first.date_folder, "14.01.25");
        assert_eq!(first.groups, vec!["3-14-05-00".to_string()]);
        assert_eq!(first.leaf, "d1");
        assert_eq!(first.remote_path(), "/fito/14.01.25/3-14-05-00/d1");

        assert_eq!(
            drain(&mut walker, session.as_mut()).await,
            vec!["14.01.25/3-14-05-00/d2", "15.01.25/1-09-00-00/d3"]
        );
    }

    #[tokio::test]
    async fn listing_failure_is_returned() {
        let remote = MemoryRemote::new();
        remote.add_dir("/calls/2025-01-14/a");
        remote.add_dir("/calls/2025-01-15/b");
        remote.fail_listing("/calls/2025-01-15");

        let mut session = remote.connect().await.unwrap();
        let mut walker = RemoteTreeWalker::new("/calls", 0);
        assert!(walker.next(session.as_mut()).await.unwrap().is_some());
        assert!(matches!(
            walker.next(session.as_mut()).await,
            Err(TransportError::List { .. })
        ));
    }

    #[tokio::test]
    async fn reset_restarts_from_root() {
        let remote = MemoryRemote::new();
        remote.add_dir("/calls/2025-01-14/a");

        let mut session = remote.connect().await.unwrap();
        let mut walker = RemoteTreeWalker::new("/calls", 0);
        assert_eq!(drain(&mut walker, session.as_mut()).await.len(), 1);
        walker.reset();
        assert_eq!(drain(&mut walker, session.as_mut()).await, vec!["2025-01-14/a"]);

        let mut missing = RemoteTreeWalker::new("/absent", 0);
        assert!(missing.next(session.as_mut()).await.is_err());
    }
}
