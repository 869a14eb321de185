mod progress;
mod status;
mod table;

pub use progress::{bounded_bar, format_duration, format_usize_commas};
pub use status::{print_command_status, CommandStatus};
pub use table::{apply_column_padding, header, styled_table, truncate};
