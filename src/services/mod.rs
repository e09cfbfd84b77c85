pub mod availability;
pub mod booking;
pub mod business;
pub mod calendar;
pub mod hold_sweeper;
pub mod ledger;
pub mod notifications;
pub mod oauth;
pub mod observe;
pub mod retry_worker;
pub mod sanitize;
pub mod token_vault;
