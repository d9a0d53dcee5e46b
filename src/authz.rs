//! Ownership checks for mutating operations.
//!
//! A collection belongs to the user that created it; its cards have no owner
//! of their own and are authorized against the parent collection. The check
//! resolves the resource first and only then compares owners, so a caller
//! cannot tell "not yours" apart from "does not exist".
//!
//! A successful check yields an [`Authorized`] grant. The storage mutation
//! methods take that grant, which makes "authorize before write" a property
//! of the types rather than of each handler.

use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::auth::Identity;
use crate::error::{AuthError, StorageError};
use crate::models::{ActionId, CollectionId, UserId};
use crate::storage::Storage;

pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Permission to mutate one resource, issued by [`authorize_mutation`].
#[derive(Debug)]
pub struct Authorized<Id> {
    resource: Id,
}

impl<Id: Copy> Authorized<Id> {
    pub fn resource(&self) -> Id {
        self.resource
    }

    #[cfg(test)]
    pub(crate) fn for_tests(resource: Id) -> Self {
        Self { resource }
    }
}

/// Resolves the owning user of a resource. `Ok(None)` means the resource
/// does not exist.
#[async_trait]
pub trait OwnerLookup<Id: Send + 'static>: Send + Sync {
    async fn owner_of(&self, id: Id) -> Result<Option<UserId>, StorageError>;
}

#[async_trait]
impl OwnerLookup<CollectionId> for Storage {
    async fn owner_of(&self, id: CollectionId) -> Result<Option<UserId>, StorageError> {
        Ok(self.find_collection(id)?.map(|c| c.user_id))
    }
}

#[async_trait]
impl OwnerLookup<ActionId> for Storage {
    async fn owner_of(&self, id: ActionId) -> Result<Option<UserId>, StorageError> {
        match self.action_parent(id)? {
            Some(parent) => <Self as OwnerLookup<CollectionId>>::owner_of(self, parent).await,
            None => Ok(None),
        }
    }
}

pub async fn authorize_mutation<Id, L>(
    lookup: &L,
    resource: Id,
    identity: &Identity,
) -> Result<Authorized<Id>, AuthError>
where
    Id: Copy + Display + Send + 'static,
    L: OwnerLookup<Id> + ?Sized,
{
    authorize_mutation_within(lookup, resource, identity, LOOKUP_TIMEOUT).await
}

/// Like [`authorize_mutation`] with an explicit bound on the owner lookup.
pub async fn authorize_mutation_within<Id, L>(
    lookup: &L,
    resource: Id,
    identity: &Identity,
    limit: Duration,
) -> Result<Authorized<Id>, AuthError>
where
    Id: Copy + Display + Send + 'static,
    L: OwnerLookup<Id> + ?Sized,
{
    let owner = timeout(limit, lookup.owner_of(resource))
        .await
        .map_err(|_| {
            warn!(%resource, "owner lookup timed out");
            AuthError::LookupTimedOut
        })??;

    match owner {
        None => Err(AuthError::ResourceNotFound),
        Some(owner) if owner != identity.user_id() => {
            info!(%resource, user_id = identity.user_id(), "mutation denied: not owner");
            Err(AuthError::NotOwner)
        }
        Some(_) => Ok(Authorized { resource }),
    }
}
