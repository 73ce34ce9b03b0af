//! Hard limits enforced at the engine and tenant boundaries.

/// Max resources a single tenant may hold.
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;

/// Max slots on one resource.
pub const MAX_CAPACITY: u32 = 1_000_000;

/// Max byte length of a resource or claimant id.
pub const MAX_ID_LEN: usize = 256;

/// Max byte length of a resource display name.
pub const MAX_NAME_LEN: usize = 1024;

/// Max tenants (loaded engines) per process.
pub const MAX_TENANTS: usize = 1024;

/// Max byte length of a tenant (database) name.
pub const MAX_TENANT_NAME_LEN: usize = 256;
