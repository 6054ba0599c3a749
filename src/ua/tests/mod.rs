mod test_ua_flows;
