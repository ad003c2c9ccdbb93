mod pool_tests;
mod support;
