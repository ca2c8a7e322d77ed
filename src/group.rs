//! Управление группами клиентов

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

struct Group {
    owner: String,
    members: HashSet<String>,
}

/// Результат групповой операции: успех, сообщение и затронутые участники.
pub struct GroupOpResult {
    pub success: bool,
    pub message: String,
    pub members: Vec<String>,
}

impl GroupOpResult {
    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            members: Vec::new(),
        }
    }
}

/// Реестр групп: клиент состоит не более чем в одной группе,
/// владелец всегда входит в участники, пустые группы удаляются.
pub struct GroupManager {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    client_groups: HashMap<String, String>,
    groups: HashMap<String, Group>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn register_client(&self, client_uid: &str) {
        let mut inner = self.inner.write().await;
        inner
            .client_groups
            .entry(client_uid.to_string())
            .or_default();
    }

    /// Удаляет клиента полностью. Возвращает участников затронутой группы
    /// (для рассылки group-update). Владелец при уходе передает группу
    /// любому оставшемуся участнику.
    pub async fn remove_client(&self, client_uid: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let group_id = match inner.client_groups.remove(client_uid) {
            Some(group_id) if !group_id.is_empty() => group_id,
            _ => return Vec::new(),
        };
        let group = match inner.groups.get_mut(&group_id) {
            Some(group) => group,
            None => return Vec::new(),
        };
        group.members.remove(client_uid);
        if group.owner == client_uid {
            if let Some(next_owner) = group.members.iter().next().cloned() {
                group.owner = next_owner;
            }
        }
        if group.members.is_empty() {
            inner.groups.remove(&group_id);
            return Vec::new();
        }
        group.members.iter().cloned().collect()
    }

    /// Добавляет invitee в группу inviter, создавая группу "group_<inviter>"
    /// при первом приглашении.
    pub async fn add_client(&self, inviter: &str, invitee: &str) -> GroupOpResult {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        match inner.client_groups.get(invitee) {
            None => return GroupOpResult::rejected("Invitee does not exist"),
            Some(group_id) if !group_id.is_empty() => {
                return GroupOpResult::rejected("Invitee already in group")
            }
            _ => {}
        }

        let mut group_id = inner
            .client_groups
            .get(inviter)
            .cloned()
            .unwrap_or_default();
        if group_id.is_empty() {
            group_id = format!("group_{}", inviter);
            let mut members = HashSet::new();
            members.insert(inviter.to_string());
            inner.groups.insert(
                group_id.clone(),
                Group {
                    owner: inviter.to_string(),
                    members,
                },
            );
            inner
                .client_groups
                .insert(inviter.to_string(), group_id.clone());
        }

        let group = inner.groups.get_mut(&group_id).expect("group just ensured");
        group.members.insert(invitee.to_string());
        let members: Vec<String> = group.members.iter().cloned().collect();
        inner
            .client_groups
            .insert(invitee.to_string(), group_id);

        GroupOpResult {
            success: true,
            message: "Client added to group".to_string(),
            members,
        }
    }

    /// Убирает target из его группы. Разрешено владельцу либо самому target.
    pub async fn remove_client_from_group(&self, remover: &str, target: &str) -> GroupOpResult {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let group_id = match inner.client_groups.get(target) {
            Some(group_id) if !group_id.is_empty() => group_id.clone(),
            _ => return GroupOpResult::rejected("Target not in group"),
        };
        let group = match inner.groups.get_mut(&group_id) {
            Some(group) => group,
            None => return GroupOpResult::rejected("Target not in group"),
        };
        if remover != group.owner && remover != target {
            return GroupOpResult::rejected("Only owner or self can remove");
        }
        group.members.remove(target);
        let remaining: Vec<String> = group.members.iter().cloned().collect();
        inner.client_groups.insert(target.to_string(), String::new());
        if remaining.is_empty() {
            inner.groups.remove(&group_id);
            return GroupOpResult {
                success: true,
                message: "Group removed".to_string(),
                members: Vec::new(),
            };
        }
        GroupOpResult {
            success: true,
            message: "Client removed from group".to_string(),
            members: remaining,
        }
    }

    pub async fn get_group_members(&self, client_uid: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        let group_id = match inner.client_groups.get(client_uid) {
            Some(group_id) if !group_id.is_empty() => group_id,
            _ => return Vec::new(),
        };
        inner
            .groups
            .get(group_id)
            .map(|group| group.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_owner(&self, client_uid: &str) -> bool {
        let inner = self.inner.read().await;
        let group_id = match inner.client_groups.get(client_uid) {
            Some(group_id) if !group_id.is_empty() => group_id,
            _ => return false,
        };
        inner
            .groups
            .get(group_id)
            .map(|group| group.owner == client_uid)
            .unwrap_or(false)
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_unknown_invitee_rejected() {
        let manager = GroupManager::new();
        manager.register_client("a").await;
        let result = manager.add_client("a", "ghost").await;
        assert!(!result.success);
        assert_eq!(result.message, "Invitee does not exist");
    }

    #[tokio::test]
    async fn test_add_creates_group_with_inviter_as_owner() {
        let manager = GroupManager::new();
        manager.register_client("a").await;
        manager.register_client("b").await;

        let result = manager.add_client("a", "b").await;
        assert!(result.success);
        assert_eq!(result.members.len(), 2);
        assert!(manager.is_owner("a").await);
        assert!(!manager.is_owner("b").await);
    }

    #[tokio::test]
    async fn test_add_grouped_invitee_rejected() {
        let manager = GroupManager::new();
        for uid in ["a", "b", "c"] {
            manager.register_client(uid).await;
        }
        assert!(manager.add_client("a", "b").await.success);
        let result = manager.add_client("c", "b").await;
        assert!(!result.success);
        assert_eq!(result.message, "Invitee already in group");
    }

    #[tokio::test]
    async fn test_remove_requires_owner_or_self() {
        let manager = GroupManager::new();
        for uid in ["a", "b", "c"] {
            manager.register_client(uid).await;
        }
        manager.add_client("a", "b").await;
        manager.add_client("a", "c").await;

        assert!(!manager.remove_client_from_group("b", "c").await.success);
        assert!(manager.remove_client_from_group("c", "c").await.success);
        assert!(manager.remove_client_from_group("a", "b").await.success);
    }

    #[tokio::test]
    async fn test_owner_departure_promotes_member() {
        let manager = GroupManager::new();
        for uid in ["a", "b"] {
            manager.register_client(uid).await;
        }
        manager.add_client("a", "b").await;

        let affected = manager.remove_client("a").await;
        assert_eq!(affected, vec!["b".to_string()]);
        assert!(manager.is_owner("b").await);
    }

    #[tokio::test]
    async fn test_empty_group_is_deleted() {
        let manager = GroupManager::new();
        for uid in ["a", "b"] {
            manager.register_client(uid).await;
        }
        manager.add_client("a", "b").await;
        manager.remove_client("a").await;
        let affected = manager.remove_client("b").await;
        assert!(affected.is_empty());
        assert!(manager.get_group_members("b").await.is_empty());
    }
}
