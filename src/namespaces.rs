//! Namespace well-formedness and conformance. An approval conforms to a
//! proposal when, for every required namespace key, the approved side offers
//! at least the required chains, methods and events.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::types::{Namespace, Namespaces};

/// CAIP account ids are `namespace:reference:address` with no empty parts.
pub fn validate_account(account: &str) -> Result<()> {
    let parts: Vec<&str> = account.split(':').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::MissingOrInvalid(format!(
            "account id {account} is not namespace:reference:address"
        )));
    }
    Ok(())
}

/// Chain id of an account: the `namespace:reference` prefix.
pub fn account_to_chain(account: &str) -> Result<String> {
    validate_account(account)?;
    let mut parts = account.split(':');
    let namespace = parts.next().unwrap_or_default();
    let reference = parts.next().unwrap_or_default();
    Ok(format!("{namespace}:{reference}"))
}

/// Chains a namespace covers, whether stated directly or implied by its
/// accounts.
pub fn namespace_chains(namespace: &Namespace) -> Result<HashSet<String>> {
    let mut chains: HashSet<String> = namespace.chains.iter().cloned().collect();
    if let Some(accounts) = &namespace.accounts {
        for account in accounts {
            chains.insert(account_to_chain(account)?);
        }
    }
    Ok(chains)
}

/// Checks account well-formedness across all namespaces, and that every
/// account sits on a chain its namespace declares.
pub fn validate_namespaces(namespaces: &Namespaces) -> Result<()> {
    for (key, namespace) in namespaces {
        let declared: HashSet<&String> = namespace.chains.iter().collect();
        if let Some(accounts) = &namespace.accounts {
            for account in accounts {
                let chain = account_to_chain(account)?;
                if !declared.is_empty() && !declared.contains(&chain) {
                    return Err(Error::UnsupportedAccounts(format!(
                        "account {account} is outside the chains of namespace {key}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Superset check of an approval (or update) against the required namespaces.
pub fn assert_conforming(required: &Namespaces, approved: &Namespaces) -> Result<()> {
    validate_namespaces(approved)?;
    for (key, required_ns) in required {
        let Some(approved_ns) = approved.get(key) else {
            return Err(Error::NonConformingNamespaces(format!(
                "namespace {key} is required but not approved"
            )));
        };

        let approved_chains = namespace_chains(approved_ns)?;
        for chain in &required_ns.chains {
            if !approved_chains.contains(chain) {
                return Err(Error::NonConformingNamespaces(format!(
                    "chain {chain} of namespace {key} is not approved"
                )));
            }
        }

        let approved_methods: HashSet<&String> = approved_ns.methods.iter().collect();
        for method in &required_ns.methods {
            if !approved_methods.contains(method) {
                return Err(Error::NonConformingNamespaces(format!(
                    "method {method} of namespace {key} is not approved"
                )));
            }
        }

        let approved_events: HashSet<&String> = approved_ns.events.iter().collect();
        for event in &required_ns.events {
            if !approved_events.contains(event) {
                return Err(Error::NonConformingNamespaces(format!(
                    "event {event} of namespace {key} is not approved"
                )));
            }
        }
    }
    Ok(())
}
