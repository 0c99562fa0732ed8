mod tests_single_node;
