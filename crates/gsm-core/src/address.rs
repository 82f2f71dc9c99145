//! Elastic address management
//!
//! A pinned server keeps the same allocation across pause/resume. The
//! allocation id lives on the record; at most one record may hold it.

use crate::error::{ConflictError, GsmError, Result, ValidationError};
use crate::model::{ServerInventory, ServerRecord};
use crate::orchestrator::{Orchestrator, client_token};
use gsm_cloud::{Address, AddressSpec, tags, with_retry};
use serde::Serialize;

/// A system-tagged address and the record holding it, if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressView {
    pub allocation_id: String,
    pub public_ip: String,
    pub associated: bool,
    pub holder: Option<String>,
}

pub struct AddressManager<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> AddressManager<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Pin an address to the record's instance
    ///
    /// With `requested`, that allocation is used. Otherwise an unassociated
    /// system address nobody holds is reused before a new one is allocated.
    #[tracing::instrument(skip(self, record, inventory), fields(server = %record.name))]
    pub async fn pin(
        &self,
        record: &ServerRecord,
        inventory: &ServerInventory,
        requested: Option<&str>,
    ) -> Result<Address> {
        let provider = self.orchestrator.provider();
        let retry = &self.orchestrator.options().retry;

        if let Some(allocation) = &record.allocation_id {
            return Err(ConflictError::AlreadyPinned {
                server: record.name.clone(),
                allocation: allocation.clone(),
            }
            .into());
        }
        let instance_id = record
            .instance_id
            .as_deref()
            .ok_or_else(|| GsmError::not_found("instance", &record.name))?;

        let existing = with_retry(retry, "list addresses", || provider.list_addresses())
            .await
            .map_err(|e| GsmError::provider("list", "addresses", provider.region(), e))?;

        let (address, allocated) = match requested {
            Some(allocation) => {
                if let Some(holder) = inventory.pin_holder(allocation) {
                    return Err(ConflictError::AlreadyPinnedElsewhere {
                        allocation: allocation.to_string(),
                        holder: holder.name.clone(),
                    }
                    .into());
                }
                let address = existing
                    .into_iter()
                    .find(|a| a.allocation_id == allocation)
                    .ok_or_else(|| GsmError::not_found("address", allocation))?;
                if let Some(other) = address.instance_id.as_deref().filter(|i| *i != instance_id) {
                    return Err(ConflictError::AlreadyPinnedElsewhere {
                        allocation: allocation.to_string(),
                        holder: other.to_string(),
                    }
                    .into());
                }
                (address, false)
            }
            None => match existing
                .into_iter()
                .find(|a| !a.is_associated() && inventory.pin_holder(&a.allocation_id).is_none())
            {
                Some(address) => {
                    tracing::info!(allocation = %address.allocation_id, "Reusing unassociated address");
                    (address, false)
                }
                None => {
                    let spec = AddressSpec {
                        tags: holder_tags(record),
                        client_token: Some(client_token(&record.id, "address")),
                    };
                    let address = with_retry(retry, "allocate address", || {
                        provider.allocate_address(&spec)
                    })
                    .await
                    .map_err(|e| GsmError::provider("allocate", "address", &record.name, e))?;
                    tracing::info!(allocation = %address.allocation_id, "Allocated address");
                    (address, true)
                }
            },
        };

        if let Err(e) = with_retry(retry, "associate address", || {
            provider.associate_address(&address.allocation_id, instance_id)
        })
        .await
        {
            if allocated {
                if let Err(release) = provider.release_address(&address.allocation_id).await {
                    tracing::warn!(
                        "Could not release {} after failed association: {}",
                        address.allocation_id,
                        release
                    );
                }
            }
            return Err(GsmError::provider(
                "associate",
                "address",
                &address.allocation_id,
                e,
            ));
        }

        // adoption metadata; the association itself already succeeded
        if !allocated {
            for (key, value) in holder_tags(record) {
                if let Err(e) = provider.set_tag(&address.allocation_id, &key, &value).await {
                    tracing::warn!("Could not tag {}: {}", address.allocation_id, e);
                }
            }
        }
        if let Err(e) = provider
            .set_tag(instance_id, tags::ADDRESS_ALLOCATION, &address.allocation_id)
            .await
        {
            tracing::warn!("Could not tag {}: {}", instance_id, e);
        }

        Ok(address)
    }

    /// Disassociate and release the pinned address
    ///
    /// Requires `confirm`: an allocation left unassociated is still billed,
    /// and a released one cannot be recovered.
    #[tracing::instrument(skip(self, record), fields(server = %record.name))]
    pub async fn unpin(&self, record: &ServerRecord, confirm: bool) -> Result<()> {
        let provider = self.orchestrator.provider();
        let retry = &self.orchestrator.options().retry;

        let Some(allocation) = record.allocation_id.as_deref() else {
            return Err(ConflictError::NotPinned {
                server: record.name.clone(),
            }
            .into());
        };
        if !confirm {
            return Err(ValidationError::ConfirmationRequired(format!(
                "Unpinning '{}' releases address {}; it cannot be recovered. Pass --yes to confirm.",
                record.name, allocation
            ))
            .into());
        }

        for (operation, result) in [
            (
                "disassociate",
                with_retry(retry, "disassociate address", || {
                    provider.disassociate_address(allocation)
                })
                .await,
            ),
            (
                "release",
                with_retry(retry, "release address", || provider.release_address(allocation))
                    .await,
            ),
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Address {} already absent", allocation);
                }
                Err(e) => return Err(GsmError::provider(operation, "address", allocation, e)),
            }
        }

        if let Some(instance_id) = record.instance_id.as_deref() {
            if let Err(e) = provider.delete_tag(instance_id, tags::ADDRESS_ALLOCATION).await {
                tracing::warn!("Could not untag {}: {}", instance_id, e);
            }
        }
        tracing::info!(allocation, "Released pinned address");
        Ok(())
    }

    /// Re-associate a record's retained allocation with its instance
    pub async fn reassociate(&self, record: &ServerRecord) -> Result<Option<String>> {
        let (Some(allocation), Some(instance_id)) =
            (record.allocation_id.as_deref(), record.instance_id.as_deref())
        else {
            return Ok(None);
        };
        let provider = self.orchestrator.provider();
        let retry = &self.orchestrator.options().retry;

        with_retry(retry, "associate address", || {
            provider.associate_address(allocation, instance_id)
        })
        .await
        .map_err(|e| GsmError::provider("associate", "address", allocation, e))?;

        let addresses = with_retry(retry, "list addresses", || provider.list_addresses())
            .await
            .map_err(|e| GsmError::provider("list", "addresses", provider.region(), e))?;
        tracing::info!(allocation, "Re-associated pinned address");
        Ok(addresses
            .into_iter()
            .find(|a| a.allocation_id == allocation)
            .map(|a| a.public_ip))
    }

    /// Every system address, annotated with its holder
    pub async fn list(&self, inventory: &ServerInventory) -> Result<Vec<AddressView>> {
        let provider = self.orchestrator.provider();
        let addresses = with_retry(&self.orchestrator.options().retry, "list addresses", || {
            provider.list_addresses()
        })
        .await
        .map_err(|e| GsmError::provider("list", "addresses", provider.region(), e))?;

        Ok(addresses
            .into_iter()
            .map(|a| AddressView {
                holder: inventory.pin_holder(&a.allocation_id).map(|r| r.name.clone()),
                associated: a.is_associated(),
                allocation_id: a.allocation_id,
                public_ip: a.public_ip,
            })
            .collect())
    }
}

fn holder_tags(record: &ServerRecord) -> gsm_cloud::Tags {
    tags::tags([
        (tags::ID, record.id.as_str()),
        (tags::GAME, record.game.as_str()),
        (tags::NAME, record.name.as_str()),
        (tags::DISPLAY_NAME, record.name.as_str()),
    ])
}
