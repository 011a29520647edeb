// Services module - Business logic

pub mod certificate;
pub mod code_generator;
pub mod holders;
pub mod ledger;
pub mod mailer;
pub mod notifier;
pub mod pdf;
pub mod qr_generator;
pub mod store;
