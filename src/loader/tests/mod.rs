mod tests_distribution;
