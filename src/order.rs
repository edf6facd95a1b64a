//! Order records and their status lifecycle
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use sled::{Db, Tree};

use crate::error::{MarketError, MarketResult};
use crate::principal::Role;
use crate::units::{Kg, Money, TimeStamp};
use crate::utils::{self, or_abort, settle};

/// `Pending -> {Approved, Rejected}`, `Approved -> Transferred`.
/// `Rejected` and `Transferred` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum OrderStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Transferred,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Order {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub listing_id: String,
    #[n(2)]
    pub buyer_id: String,
    #[n(3)]
    pub buyer_role: Role,
    #[n(4)]
    pub seller_id: String, // copied from the listing at creation
    #[n(5)]
    pub quantity_requested: Kg,
    #[n(6)]
    pub total_price: Money, // frozen at creation
    #[n(7)]
    pub status: OrderStatus,
    #[n(8)]
    pub payment_ref: Option<String>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Clone)]
pub struct OrderStore {
    pub(crate) tree: Tree,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Transferred)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Approved)
                | (OrderStatus::Pending, OrderStatus::Rejected)
                | (OrderStatus::Approved, OrderStatus::Transferred)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Approved => "approved",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Transferred => "transferred",
        }
    }
}

impl OrderStore {
    pub fn open(db: &Db) -> MarketResult<Self> {
        Ok(Self {
            tree: db.open_tree("orders")?,
        })
    }

    pub(crate) fn insert(&self, order: &Order) -> MarketResult<()> {
        self.tree.insert(order.order_id.as_bytes(), utils::encode(order)?)?;
        Ok(())
    }

    pub fn find(&self, order_id: &str) -> MarketResult<Option<Order>> {
        self.tree
            .get(order_id.as_bytes())?
            .map(|bytes| utils::decode(&bytes))
            .transpose()
    }

    pub fn get(&self, order_id: &str) -> MarketResult<Order> {
        self.find(order_id)?
            .ok_or_else(|| MarketError::not_found("order", order_id))
    }

    /// Move an order along its lifecycle, re-reading it inside the write so
    /// two racing transitions cannot both succeed.
    pub(crate) fn transition(
        &self,
        order_id: &str,
        next: OrderStatus,
        payment_ref: Option<&str>,
    ) -> MarketResult<Order> {
        settle(self.tree.transaction(|tx| Self::transition_in(tx, order_id, next, payment_ref)))
    }

    pub(crate) fn transition_in(
        tx: &TransactionalTree,
        order_id: &str,
        next: OrderStatus,
        payment_ref: Option<&str>,
    ) -> ConflictableTransactionResult<Order, MarketError> {
        let Some(bytes) = tx.get(order_id.as_bytes())? else {
            return sled::transaction::abort(MarketError::not_found("order", order_id));
        };
        let mut order: Order = or_abort(utils::decode(&bytes))?;

        if !order.status.can_transition_to(next) {
            return sled::transaction::abort(MarketError::InvalidState(format!(
                "order {order_id} is {} and cannot become {}",
                order.status.as_str(),
                next.as_str()
            )));
        }
        order.status = next;
        if let Some(payment_ref) = payment_ref {
            order.payment_ref = Some(payment_ref.to_string());
        }
        order.updated_at = TimeStamp::new();
        tx.insert(order_id.as_bytes(), or_abort(utils::encode(&order))?)?;

        Ok(order)
    }

    /// Orders where `user_id` is the buyer and where they are the seller,
    /// each newest first.
    pub fn split_by_party(&self, user_id: &str) -> MarketResult<(Vec<Order>, Vec<Order>)> {
        let mut purchases = Vec::new();
        let mut sales = Vec::new();
        for value in self.tree.iter().values() {
            let order: Order = utils::decode(&value?)?;
            if order.buyer_id == user_id {
                purchases.push(order);
            } else if order.seller_id == user_id {
                sales.push(order);
            }
        }
        purchases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sales.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok((purchases, sales))
    }
}
