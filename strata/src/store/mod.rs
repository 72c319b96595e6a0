//! Store layout, ChainId derivation, and usage measurement.

mod chain_id;
pub(crate) mod layout;
pub(crate) mod measurer;

pub use chain_id::{temp_volume_name, ChainId};
pub use layout::StoreLayout;
pub use measurer::{StoreMeasurer, VolumeSizer};
