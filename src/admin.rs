//! Operator commands that write to the configuration channel.

use crate::{
    channel::{ConfigChannel, POLICY_KEY, SERVERS_KEY, SERVER_UPDATES},
    policy::PolicyType,
    pool::ServerPool,
};

/// Merges `addresses` into the stored server list and announces the result
/// to every subscribed worker. Returns the new list and how many
/// subscribers received it.
pub async fn add_servers<C: ConfigChannel>(
    channel: &C,
    addresses: &str,
) -> crate::Result<(String, usize)> {
    let mut pool = ServerPool::new();
    if let Some(current) = channel.get(SERVERS_KEY).await? {
        pool.apply_message(&current);
    }
    pool.apply_message(addresses);

    let list = pool
        .servers()
        .iter()
        .map(|s| s.address.as_str())
        .collect::<Vec<_>>()
        .join(",");

    channel.put(SERVERS_KEY, &list, None).await?;
    let receivers = channel.publish(SERVER_UPDATES, &list).await?;

    Ok((list, receivers))
}

/// Forgets the stored list. Running workers keep the servers they know.
pub async fn clear_servers<C: ConfigChannel>(channel: &C) -> crate::Result<()> {
    channel.delete(SERVERS_KEY).await?;
    Ok(())
}

/// Stores the algorithm workers pick up on their next policy check.
pub async fn set_policy<C: ConfigChannel>(channel: &C, name: &str) -> crate::Result<PolicyType> {
    let policy: PolicyType = name.parse()?;
    channel.put(POLICY_KEY, policy.name(), None).await?;
    Ok(policy)
}

pub async fn reset<C: ConfigChannel>(channel: &C) -> crate::Result<()> {
    channel.clear().await?;
    Ok(())
}
