//! Material access policy seams.
//!
//! The content model (containers, visibility, collaborators) belongs to the
//! content service. This subsystem only asks two questions of it:
//! - may user U access material M
//! - what is material M (type, size, where the original lives)

use crate::protocol::models::MaterialInfo;
use crate::OfflineError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

/// Answers whether a user may access a material.
#[async_trait]
pub trait MaterialAccessGate: Send + Sync {
    /// True if the material exists, is not deleted, and the user can access
    /// its container (owner, public, or accepted collaborator).
    async fn check_access(&self, user_id: Uuid, material_id: Uuid) -> Result<bool, OfflineError>;
}

/// Looks up material metadata.
#[async_trait]
pub trait MaterialCatalog: Send + Sync {
    /// Metadata of a material, or `None` if it does not exist.
    async fn get(&self, material_id: Uuid) -> Result<Option<MaterialInfo>, OfflineError>;
}

/// Check access, mapping a denial to `AccessDenied`.
///
/// # Errors
/// * `AccessDenied` - The gate said no
/// * Any gate transport error, unchanged
pub async fn require_access(
    gate: &dyn MaterialAccessGate,
    user_id: Uuid,
    material_id: Uuid,
) -> Result<(), OfflineError> {
    if gate.check_access(user_id, material_id).await? {
        Ok(())
    } else {
        tracing::info!(%user_id, %material_id, "material access denied");
        Err(OfflineError::AccessDenied)
    }
}

#[derive(Debug, Clone, Default)]
struct Container {
    owner_id: Uuid,
    public: bool,
    collaborators: HashSet<Uuid>,
}

#[derive(Debug, Clone)]
struct Material {
    info: MaterialInfo,
    deleted: bool,
}

/// In-memory material directory implementing both seams.
///
/// Mirrors the content service's rules; used by tests and embedded setups.
#[derive(Debug, Default)]
pub struct MaterialDirectory {
    containers: RwLock<HashMap<Uuid, Container>>,
    materials: RwLock<HashMap<Uuid, Material>>,
}

impl MaterialDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container.
    pub fn add_container(&self, container_id: Uuid, owner_id: Uuid, public: bool) {
        if let Ok(mut containers) = self.containers.write() {
            containers.insert(
                container_id,
                Container {
                    owner_id,
                    public,
                    collaborators: HashSet::new(),
                },
            );
        }
    }

    /// Record an accepted collaborator on a container.
    pub fn add_collaborator(&self, container_id: Uuid, user_id: Uuid) {
        if let Ok(mut containers) = self.containers.write() {
            if let Some(c) = containers.get_mut(&container_id) {
                c.collaborators.insert(user_id);
            }
        }
    }

    /// Register a material.
    pub fn add_material(&self, info: MaterialInfo) {
        if let Ok(mut materials) = self.materials.write() {
            materials.insert(info.id, Material { info, deleted: false });
        }
    }

    /// Soft-delete a material.
    pub fn delete_material(&self, material_id: Uuid) {
        if let Ok(mut materials) = self.materials.write() {
            if let Some(m) = materials.get_mut(&material_id) {
                m.deleted = true;
            }
        }
    }

    fn lookup(&self, material_id: Uuid) -> Result<Option<Material>, OfflineError> {
        self.materials
            .read()
            .map(|m| m.get(&material_id).cloned())
            .map_err(|_| OfflineError::Store("material directory lock poisoned".to_string()))
    }
}

#[async_trait]
impl MaterialAccessGate for MaterialDirectory {
    async fn check_access(&self, user_id: Uuid, material_id: Uuid) -> Result<bool, OfflineError> {
        let Some(material) = self.lookup(material_id)? else {
            return Ok(false);
        };
        if material.deleted {
            return Ok(false);
        }
        let containers = self
            .containers
            .read()
            .map_err(|_| OfflineError::Store("material directory lock poisoned".to_string()))?;
        Ok(containers
            .get(&material.info.container_id)
            .is_some_and(|c| c.public || c.owner_id == user_id || c.collaborators.contains(&user_id)))
    }
}

#[async_trait]
impl MaterialCatalog for MaterialDirectory {
    async fn get(&self, material_id: Uuid) -> Result<Option<MaterialInfo>, OfflineError> {
        Ok(self
            .lookup(material_id)?
            .filter(|m| !m.deleted)
            .map(|m| m.info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(public: bool) -> (MaterialDirectory, Uuid, Uuid, Uuid) {
        let dir = MaterialDirectory::new();
        let owner = Uuid::new_v4();
        let container = Uuid::new_v4();
        let material = Uuid::new_v4();
        dir.add_container(container, owner, public);
        dir.add_material(MaterialInfo {
            id: material,
            container_id: container,
            title: "Week 1 slides".to_string(),
            file_type: "pdf".to_string(),
            file_url: "materials/week1.pdf".to_string(),
            file_size: 1024,
        });
        (dir, owner, container, material)
    }

    #[tokio::test]
    async fn test_owner_and_public_access() {
        let (dir, owner, _, material) = setup(false);
        assert!(dir.check_access(owner, material).await.unwrap());
        assert!(!dir.check_access(Uuid::new_v4(), material).await.unwrap());

        let (public_dir, _, _, public_material) = setup(true);
        assert!(public_dir
            .check_access(Uuid::new_v4(), public_material)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_collaborator_access() {
        let (dir, _, container, material) = setup(false);
        let friend = Uuid::new_v4();
        dir.add_collaborator(container, friend);
        assert!(dir.check_access(friend, material).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_material_denied() {
        let (dir, owner, _, material) = setup(true);
        dir.delete_material(material);
        assert!(!dir.check_access(owner, material).await.unwrap());
        assert!(MaterialCatalog::get(&dir, material).await.unwrap().is_none());
        assert!(matches!(
            require_access(&dir, owner, material).await,
            Err(OfflineError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn test_unknown_material_denied() {
        let (dir, owner, _, _) = setup(true);
        assert!(!dir.check_access(owner, Uuid::new_v4()).await.unwrap());
    }
}
