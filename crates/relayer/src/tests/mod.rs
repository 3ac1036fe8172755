mod relay_test;
