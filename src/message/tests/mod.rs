mod test_uri;
