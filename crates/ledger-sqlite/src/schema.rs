pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE domains (
  domain          TEXT PRIMARY KEY,
  first_seen_ms   INTEGER NOT NULL
);

CREATE TABLE subdomains (
  subdomain       TEXT PRIMARY KEY,
  domain          TEXT NOT NULL REFERENCES domains(domain),
  takeover        TEXT NOT NULL DEFAULT '',
  first_seen_ms   INTEGER NOT NULL,
  last_seen_ms    INTEGER NOT NULL
);

CREATE TABLE ports (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  port            INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  subdomain       TEXT NOT NULL REFERENCES subdomains(subdomain),
  protocol        TEXT NOT NULL,
  service         TEXT NOT NULL DEFAULT '',
  product         TEXT NOT NULL DEFAULT '',
  version         TEXT NOT NULL DEFAULT '',
  screenshot      TEXT,
  first_seen_ms   INTEGER NOT NULL,
  UNIQUE (port, subdomain, protocol, service, product, version)
);

CREATE INDEX idx_subdomains_domain ON subdomains(domain);
CREATE INDEX idx_ports_subdomain ON ports(subdomain);

COMMIT;
"#
;
