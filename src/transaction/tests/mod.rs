mod test_server_transaction;
