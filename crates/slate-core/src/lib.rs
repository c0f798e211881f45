pub mod diff;
pub mod errors;
pub mod events;
pub mod ids;
pub mod notify;
pub mod proposal;
pub mod roles;
