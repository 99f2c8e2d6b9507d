mod tests_frozen;
mod tests_tree;
