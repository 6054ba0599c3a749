mod test_authenticate;
