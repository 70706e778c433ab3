//! Crate-level scenario tests.


mod call_flow_tests;
