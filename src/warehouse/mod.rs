//! Warehouse hand-off: logical schema, type mapping and the session closer

pub mod clickhouse;
pub mod closer;
pub mod driver;
pub mod mapper;
pub mod sessions;
pub mod types;

pub use clickhouse::{clickhouse_mapper, ClickhouseType};
pub use closer::WarehouseCloser;
pub use driver::{create_table_statement, LoggingDriver, Row, WarehouseDriver};
pub use mapper::{CompositeMapper, DeferredMapper, TypeMapper};
pub use sessions::{map_schema, session_rows, session_schema, Column};
pub use types::{DataType, Field, LogicalType, Metadata, Value};
