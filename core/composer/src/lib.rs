pub mod base_config;
pub mod composer;
pub mod function_params;
pub mod io_list;
pub mod templates;

pub use base_config::{digest_hex, BaseConfig};
pub use composer::{is_connector, write_element, write_if_changed, ConfigComposer, ExportOutcome};
pub use function_params::{
    append_tree_groups, function_tree_name, load_prefixed, parse_physical_quantity,
    physical_quantity_details, physical_quantity_element, sdp3_parameter, sdp3_range, FunctionGroup,
    ImportedParameter, ImportedRange,
};
pub use io_list::{collect_entries, io_element, io_list, DiagnosticEntry};
pub use templates::TemplateSet;
