//! 凭据库协作方
//!
//! 编排器只依赖 CredentialVault trait：锁定状态、解锁、按名存取。
//! 密钥派生与落盘不在本 crate 范围内；MemoryVault 是进程内实现，供 CLI 与测试使用。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Vault is locked")]
    Locked,

    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Vault store corrupt: {0}")]
    Corrupt(String),

    #[error("No credential named {0}")]
    NotFound(String),
}

#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn is_locked(&self) -> bool;

    async fn unlock(&self, passphrase: &str) -> Result<(), VaultError>;

    /// 加密保存；锁定时返回 Locked
    async fn store(&self, name: &str, value: &str) -> Result<(), VaultError>;

    async fn reveal(&self, name: &str) -> Result<String, VaultError>;
}

#[derive(Default)]
struct VaultInner {
    passphrase: Option<String>,
    unlocked: bool,
    entries: HashMap<String, String>,
}

/// 进程内凭据库：未配置口令时，第一次解锁使用的口令即成为口令
pub struct MemoryVault {
    inner: RwLock<VaultInner>,
}

impl MemoryVault {
    pub fn new(passphrase: Option<String>) -> Self {
        Self {
            inner: RwLock::new(VaultInner {
                passphrase,
                ..VaultInner::default()
            }),
        }
    }

    /// 已解锁的空库（测试用）
    pub fn unlocked() -> Self {
        Self {
            inner: RwLock::new(VaultInner {
                unlocked: true,
                ..VaultInner::default()
            }),
        }
    }

    pub async fn lock(&self) {
        self.inner.write().await.unlocked = false;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn is_locked(&self) -> bool {
        !self.inner.read().await.unlocked
    }

    async fn unlock(&self, passphrase: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.write().await;
        match inner.passphrase.as_deref() {
            Some(expected) if expected != passphrase => return Err(VaultError::WrongPassphrase),
            Some(_) => {}
            None => inner.passphrase = Some(passphrase.to_string()),
        }
        inner.unlocked = true;
        Ok(())
    }

    async fn store(&self, name: &str, value: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.write().await;
        if !inner.unlocked {
            return Err(VaultError::Locked);
        }
        inner.entries.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn reveal(&self, name: &str) -> Result<String, VaultError> {
        let inner = self.inner.read().await;
        if !inner.unlocked {
            return Err(VaultError::Locked);
        }
        inner
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locked_vault_refuses_store() {
        let vault = MemoryVault::new(Some("hunter2".into()));
        assert!(vault.is_locked().await);
        assert_eq!(vault.store("bank", "pw").await, Err(VaultError::Locked));
        assert_eq!(vault.unlock("wrong").await, Err(VaultError::WrongPassphrase));
        vault.unlock("hunter2").await.unwrap();
        vault.store("bank", "pw").await.unwrap();
        assert_eq!(vault.reveal("bank").await.unwrap(), "pw");
    }

    #[tokio::test]
    async fn test_first_unlock_sets_passphrase() {
        let vault = MemoryVault::new(None);
        vault.unlock("first").await.unwrap();
        vault.lock().await;
        assert_eq!(vault.unlock("second").await, Err(VaultError::WrongPassphrase));
        assert!(vault.unlock("first").await.is_ok());
        assert_eq!(vault.reveal("none").await, Err(VaultError::NotFound("none".into())));
    }
}
