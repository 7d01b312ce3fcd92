pub mod chain_status;
