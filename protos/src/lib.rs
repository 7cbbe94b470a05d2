#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]

// NOTE: Prost relies on the existence of this nested module structure because
// it uses multiple `super` references to traverse out of a module to refer to
// protos in other modules.

pub mod bmc {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/bmc.v1.rs"));
    }
    pub mod manager {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/bmc.manager.v1.rs"));
        }
    }
    pub mod gateway {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/bmc.gateway.v1.rs"));
        }
    }
    pub mod agent {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/bmc.agent.v1.rs"));
        }
    }
}

#[cfg(test)]
mod tests;
