mod node_test;
