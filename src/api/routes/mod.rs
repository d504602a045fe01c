pub mod calls;
pub mod identity;
