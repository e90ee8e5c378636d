mod common;

mod retry_loop_tests;
