//! Lookups into the order and vendor catalogues owned by other services.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use haggle_core::{Currency, OrderId, TenantId, VendorId};

/// What negotiation needs to know about an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub currency: Currency,
}

/// Tenant-scoped view of orders and vendors.
pub trait Directory: Send + Sync {
    fn order(&self, tenant_id: TenantId, order_id: OrderId) -> Option<OrderRef>;
    fn vendor_exists(&self, tenant_id: TenantId, vendor_id: VendorId) -> bool;
}

impl<D> Directory for Arc<D>
where
    D: Directory + ?Sized,
{
    fn order(&self, tenant_id: TenantId, order_id: OrderId) -> Option<OrderRef> {
        (**self).order(tenant_id, order_id)
    }

    fn vendor_exists(&self, tenant_id: TenantId, vendor_id: VendorId) -> bool {
        (**self).vendor_exists(tenant_id, vendor_id)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    orders: RwLock<HashMap<(TenantId, OrderId), OrderRef>>,
    vendors: RwLock<HashSet<(TenantId, VendorId)>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_order(&self, tenant_id: TenantId, order_id: OrderId, currency: Currency) {
        if let Ok(mut orders) = self.orders.write() {
            orders.insert((tenant_id, order_id), OrderRef { currency });
        }
    }

    pub fn add_vendor(&self, tenant_id: TenantId, vendor_id: VendorId) {
        if let Ok(mut vendors) = self.vendors.write() {
            vendors.insert((tenant_id, vendor_id));
        }
    }
}

impl Directory for InMemoryDirectory {
    fn order(&self, tenant_id: TenantId, order_id: OrderId) -> Option<OrderRef> {
        let orders = self.orders.read().ok()?;
        orders.get(&(tenant_id, order_id)).copied()
    }

    fn vendor_exists(&self, tenant_id: TenantId, vendor_id: VendorId) -> bool {
        self.vendors
            .read()
            .map(|v| v.contains(&(tenant_id, vendor_id)))
            .unwrap_or(false)
    }
}
