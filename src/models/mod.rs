// Models module - Database entity representations

pub mod gift_card;
pub mod holder;

pub use gift_card::{CardChange, GiftCard, NewGiftCard};
pub use holder::Holder;
