// Contact directory
// Roster of known peers, independent of the open conversation

use anyhow::{anyhow, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::models::{Contact, ContactPatch, ContactStatus, MessageBody};
use super::backend::RosterSource;
use super::TransportError;

/// Preview shown for the self entry until something else is set.
pub const SELF_PREVIEW: &str = "Your profile";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryState {
    me: Contact,
    others: Vec<Contact>,
}

/// Shared handle to the roster. The self entry is always listed first.
#[derive(Clone)]
pub struct ContactDirectory {
    state: Arc<TokioMutex<DirectoryState>>,
}

impl ContactDirectory {
    pub fn new(me: Contact) -> Self {
        Self::from_parts(me, Vec::new())
    }

    fn from_parts(mut me: Contact, others: Vec<Contact>) -> Self {
        if me.last_message.is_empty() {
            me.last_message = SELF_PREVIEW.to_string();
        }
        let others = others.into_iter().filter(|c| c.id != me.id).collect();
        Self {
            state: Arc::new(TokioMutex::new(DirectoryState { me, others })),
        }
    }

    /// Default location of the persisted directory.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("parley");
        Ok(dir.join("contacts.json"))
    }

    /// Restore a directory saved with [`Self::save`]. A missing file yields a
    /// directory holding only `me`. The configured `me` replaces whatever
    /// self entry was saved.
    pub fn load(path: &Path, me: Contact) -> Result<Self> {
        if !path.exists() {
            info!("No saved contacts at {}, starting empty", path.display());
            return Ok(Self::new(me));
        }

        let file = File::open(path)?;
        let saved: DirectoryState = serde_json::from_reader(file)?;
        info!("Loaded {} contacts from {}", saved.others.len(), path.display());

        Ok(Self::from_parts(me, saved.others))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.lock().await.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &state)?;
        info!("Saved {} contacts to {}", state.others.len(), path.display());
        Ok(())
    }

    /// Replace the directory with a remote roster snapshot.
    ///
    /// The self entry stays first whatever its remote position; the remote
    /// version of it wins over local optimistic edits. Duplicate ids keep
    /// their first occurrence.
    pub async fn sync(&self, roster: Vec<Contact>) {
        let mut state = self.state.lock().await;
        let self_id = state.me.id.clone();
        let mut seen = HashSet::new();
        let mut others = Vec::with_capacity(roster.len());

        for contact in roster {
            if !seen.insert(contact.id.clone()) {
                continue;
            }
            if contact.id == self_id {
                state.me = contact;
            } else {
                others.push(contact);
            }
        }
        debug!("Directory synced: {} contacts", others.len());
        state.others = others;
    }

    /// Everything, self first.
    pub async fn contacts(&self) -> Vec<Contact> {
        let state = self.state.lock().await;
        std::iter::once(state.me.clone())
            .chain(state.others.iter().cloned())
            .collect()
    }

    pub async fn me(&self) -> Contact {
        self.state.lock().await.me.clone()
    }

    pub async fn get(&self, contact_id: &str) -> Option<Contact> {
        let state = self.state.lock().await;
        if state.me.id == contact_id {
            return Some(state.me.clone());
        }
        state.others.iter().find(|c| c.id == contact_id).cloned()
    }

    /// Case-insensitive substring match on display name, self excluded,
    /// directory order kept.
    pub async fn filter(&self, query: &str) -> Vec<Contact> {
        let needle = query.to_lowercase();
        let state = self.state.lock().await;
        state
            .others
            .iter()
            .filter(|c| c.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Optimistically edit the self entry until the next sync.
    pub async fn update_self(&self, patch: ContactPatch) {
        let mut state = self.state.lock().await;
        if let Some(name) = patch.name {
            state.me.name = name;
        }
        if let Some(avatar) = patch.avatar {
            state.me.avatar = Some(avatar);
        }
        if let Some(last_message) = patch.last_message {
            state.me.last_message = last_message;
        }
    }

    /// Show a just-sent message as the contact's preview. Returns false for
    /// unknown contacts.
    pub async fn record_preview(&self, contact_id: &str, body: &MessageBody) -> bool {
        let mut state = self.state.lock().await;
        match state.others.iter_mut().find(|c| c.id == contact_id) {
            Some(contact) => {
                contact.last_message = body.preview();
                true
            }
            None => false,
        }
    }

    pub async fn set_presence(&self, contact_id: &str, status: ContactStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.others.iter_mut().find(|c| c.id == contact_id) {
            Some(contact) => {
                contact.status = status;
                true
            }
            None => false,
        }
    }

    /// Keep the directory in sync with a roster feed until it ends.
    pub async fn follow(&self, roster: Arc<dyn RosterSource>) -> Result<JoinHandle<()>, TransportError> {
        let mut snapshots = roster.subscribe_roster().await?;
        let directory = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                directory.sync(snapshot).await;
            }
            debug!("Roster feed ended");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn me() -> Contact {
        Contact::new("current-user", "self")
    }

    #[tokio::test]
    async fn test_filter_excludes_self_and_keeps_order() {
        let directory = ContactDirectory::new(me());
        directory
            .sync(vec![
                Contact::new("1", "Daniel"),
                Contact::new("2", "Zeal"),
                Contact::new("current-user", "self"),
                Contact::new("3", "Dana"),
            ])
            .await;

        let names: Vec<String> = directory.filter("DAN").await.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Daniel", "Dana"]);
        assert!(directory.filter("self").await.is_empty());
        assert_eq!(directory.filter("").await.len(), 3);
    }

    #[tokio::test]
    async fn test_self_is_pinned_first() {
        let directory = ContactDirectory::new(me());
        let mut remote_me = me();
        remote_me.avatar = Some("remote.png".to_string());
        directory
            .sync(vec![Contact::new("1", "Daniel"), remote_me, Contact::new("1", "Duplicate")])
            .await;

        let contacts = directory.contacts().await;
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].id, "current-user");
        assert_eq!(contacts[0].avatar.as_deref(), Some("remote.png"));
        assert_eq!(contacts[1].name, "Daniel");
    }

    #[tokio::test]
    async fn test_update_self_is_reconciled_on_sync() {
        let directory = ContactDirectory::new(me());
        directory
            .update_self(ContactPatch {
                avatar: Some("new.png".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(directory.me().await.avatar.as_deref(), Some("new.png"));

        let mut confirmed = me();
        confirmed.avatar = Some("cdn/new.png".to_string());
        directory.sync(vec![confirmed]).await;
        assert_eq!(directory.me().await.avatar.as_deref(), Some("cdn/new.png"));

        // A roster without the self entry leaves the local one alone
        directory.sync(vec![Contact::new("1", "Daniel")]).await;
        assert_eq!(directory.me().await.avatar.as_deref(), Some("cdn/new.png"));
    }

    #[tokio::test]
    async fn test_record_preview_and_presence() {
        let directory = ContactDirectory::new(me());
        directory.sync(vec![Contact::new("1", "Daniel")]).await;

        assert!(directory.record_preview("1", &MessageBody::text("hi")).await);
        assert!(!directory.record_preview("ghost", &MessageBody::text("hi")).await);
        assert!(directory.set_presence("1", ContactStatus::Online).await);

        let daniel = directory.get("1").await.unwrap();
        assert_eq!(daniel.last_message, "hi");
        assert_eq!(daniel.status, ContactStatus::Online);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("nested").join("contacts.json");

        let directory = ContactDirectory::new(me());
        directory
            .sync(vec![Contact::new("1", "Daniel"), Contact::new("2", "Zeal")])
            .await;
        directory.save(&path).await?;

        let restored = ContactDirectory::load(&path, Contact::new("current-user", "Renamed"))?;
        let contacts = restored.contacts().await;
        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts[0].name, "Renamed");
        assert_eq!(contacts[0].last_message, SELF_PREVIEW);
        assert_eq!(contacts[2].name, "Zeal");

        let missing = ContactDirectory::load(&temp_dir.path().join("none.json"), me())?;
        assert_eq!(missing.contacts().await.len(), 1);
        Ok(())
    }
}
