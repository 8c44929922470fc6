// Derivation of the KV key names shared by producers, the broker, and proxy
// handler pods. Every party derives the same names independently, so the
// formulas here are a wire contract: changing a salt or the concatenation
// order strands every queue already in the store.
use sha1::{Digest, Sha1};

const PROXY_QUEUE_SALT: &str = "proxy-queue-salt";
const PROXY_REGO_SALT: &str = "proxy-rego-salt";
const ENVIRONMENT_QUEUE_SALT: &str = "environment-queue-salt";

/// Lower-hex SHA-1 of a string, the hash every derived key is built from.
pub fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// An environment is identified by its repository and branch.
pub fn environment_id(repo_name: &str, branch_name: &str) -> String {
    format!("{repo_name}/{branch_name}")
}

/// Per-environment base handed to environment provisioners. Proxy-level key
/// names derive from it, but it reveals nothing about other environments.
pub fn proxy_key_base(environment_id: &str, source_key: &str) -> String {
    sha1_hex(&format!("{environment_id}{source_key}{PROXY_QUEUE_SALT}"))
}

/// Registration set a proxy handler heartbeats its destination list into.
pub fn proxy_rego_key(proxy_key_base: &str, proxy_name: &str) -> String {
    format!(
        "R{}",
        sha1_hex(&format!("{proxy_key_base}{proxy_name}{PROXY_REGO_SALT}"))
    )
}

/// Prefix every destination list registered under a proxy name must carry.
/// The dispatcher refuses to publish to registrations outside it.
pub fn proxy_list_key_prefix(proxy_key_base: &str, proxy_name: &str) -> String {
    format!(
        "P{}",
        sha1_hex(&format!("{proxy_key_base}{proxy_name}{PROXY_QUEUE_SALT}"))
    )
}

/// Destination queue for update-environment envelopes.
pub fn env_dest_key(environment_id: &str, source_key: &str) -> String {
    format!(
        "E{}",
        sha1_hex(&format!("{environment_id}{source_key}{ENVIRONMENT_QUEUE_SALT}"))
    )
}

/// Set of proxy names currently expected to exist for an environment.
pub fn env_stack_key(environment_id: &str, source_key: &str) -> String {
    format!("S{}", env_dest_key(environment_id, source_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The vectors below pin the derivation against the deployed key space.

    #[test]
    fn proxy_key_base_matches_known_vector() {
        assert_eq!(
            proxy_key_base("environment", "test"),
            "e443bff3430372ffadbfb7d6c0d5755f8f26d030"
        );
    }

    #[test]
    fn proxy_rego_key_matches_known_vector() {
        assert_eq!(
            proxy_rego_key("ef66f0f10e112358a0e6208246ffb4962355113b", "test"),
            "R3d384b6d84b2fb0d12fb25db6335f0aed174a304"
        );
    }

    #[test]
    fn environment_id_joins_repo_and_branch() {
        assert_eq!(environment_id("env321", "mabranch"), "env321/mabranch");
    }

    #[test]
    fn namespace_prefixes_do_not_collide() {
        let rego = proxy_rego_key("base", "proxy");
        let list = proxy_list_key_prefix("base", "proxy");
        let dest = env_dest_key("env/branch", "queue");
        let stack = env_stack_key("env/branch", "queue");
        assert!(rego.starts_with('R'));
        assert!(list.starts_with('P'));
        assert!(dest.starts_with('E'));
        assert!(stack.starts_with("SE"));
        assert_eq!(stack[1..], dest);
    }

    #[test]
    fn derivation_is_pure() {
        assert_eq!(
            proxy_key_base("environment", "test"),
            proxy_key_base("environment", "test")
        );
    }
}
