use crate::error::{SchedulingError, SchedulingResult};

/// The request metadata header that carries the tenant ID.
pub const ORG_ID_HEADER: &str = "x-scope-orgid";

/// The separator between tenant IDs of a multi-tenant request.
pub const TENANT_ID_SEPARATOR: char = '|';

const MAX_TENANT_ID_LENGTH: usize = 150;

/// Per-tenant limits consumed by the scheduler.
pub trait Limits: Send + Sync {
    /// The maximum number of queriers that can serve the tenant,
    /// or 0 if the tenant can be served by all queriers.
    fn max_queriers_per_tenant(&self, tenant: &str) -> usize;
}

/// The same limits for every tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticLimits {
    pub max_queriers_per_tenant: usize,
}

impl Limits for StaticLimits {
    fn max_queriers_per_tenant(&self, _tenant: &str) -> usize {
        self.max_queriers_per_tenant
    }
}

pub fn validate_tenant_id(tenant: &str) -> SchedulingResult<()> {
    if tenant.is_empty() {
        return Err(SchedulingError::invalid("no tenant ID"));
    }
    if tenant.len() > MAX_TENANT_ID_LENGTH {
        return Err(SchedulingError::invalid(format!(
            "tenant ID is too long: max {MAX_TENANT_ID_LENGTH} characters"
        )));
    }
    if let Some(c) = tenant.chars().find(|c| !is_supported_char(*c)) {
        return Err(SchedulingError::invalid(format!(
            "tenant ID '{tenant}' contains unsupported character '{c}'"
        )));
    }
    if tenant == "." || tenant == ".." {
        return Err(SchedulingError::invalid(format!(
            "tenant ID is '.' or '..': {tenant}"
        )));
    }
    Ok(())
}

fn is_supported_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '!' | '-' | '_' | '.' | '*' | '\'' | '(' | ')')
}

/// Splits an org ID into its sorted and de-duplicated tenant IDs.
pub fn tenant_ids_from_org_id(org_id: &str) -> SchedulingResult<Vec<String>> {
    if org_id.is_empty() {
        return Err(SchedulingError::invalid("no org ID"));
    }
    let mut tenants = org_id
        .split(TENANT_ID_SEPARATOR)
        .map(|tenant| {
            validate_tenant_id(tenant)?;
            Ok(tenant.to_string())
        })
        .collect::<SchedulingResult<Vec<_>>>()?;
    tenants.sort();
    tenants.dedup();
    Ok(tenants)
}

/// Returns the smallest positive value of the limit among the tenants,
/// or 0 if the limit is 0 for every tenant.
pub fn smallest_positive_non_zero_per_tenant<F>(tenants: &[String], f: F) -> usize
where
    F: Fn(&str) -> usize,
{
    tenants
        .iter()
        .map(|t| f(t))
        .filter(|x| *x > 0)
        .min()
        .unwrap_or(0)
}
