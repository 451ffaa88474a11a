//! Collection analyzer
//!
//! One walk over the tree enumerating what the plugin loader must
//! provide: the collection's protocol, every concrete auth type, and
//! every value provider referenced by a variable record.

use questplugin::Requirements;
use tracing::debug;

use super::model::{Collection, Item, Variable};

/// Enumerate the plugin requirements of a collection
pub fn analyze(collection: &Collection) -> Requirements {
    let mut requirements = Requirements::default();

    if !collection.info.protocol.trim().is_empty() {
        requirements.protocols.insert(collection.info.protocol.clone());
    }

    if let Some(auth) = &collection.auth {
        if !auth.is_none() && !auth.is_inherit() {
            requirements.auth_types.insert(auth.auth_type.clone());
        }
    }
    collect_providers(collection.variables.values(), &mut requirements);

    collection.walk(&mut |item| {
        let auth = match item {
            Item::Folder(f) => f.auth.as_ref(),
            Item::Request(r) => r.auth.as_ref(),
        };
        if let Some(auth) = auth {
            if !auth.is_none() && !auth.is_inherit() {
                requirements.auth_types.insert(auth.auth_type.clone());
            }
        }
    });

    debug!(
        protocols = requirements.protocols.len(),
        auth_types = requirements.auth_types.len(),
        providers = requirements.value_providers.len(),
        "Collection analysis complete"
    );
    requirements
}

fn collect_providers<'a>(variables: impl Iterator<Item = &'a Variable>, requirements: &mut Requirements) {
    for variable in variables {
        if let Some(provider) = variable.provider() {
            requirements.value_providers.insert(provider.to_string());
        }
    }
}
