mod substrate;
mod table;

pub use substrate::{EbpfProgram, EbpfSubstrate, object_name, slot_config, slots_map_name, table_layout};
pub use table::{EbpfTable, TableLayout};
