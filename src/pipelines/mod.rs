pub mod scatac_batch;
